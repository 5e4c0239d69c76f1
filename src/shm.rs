//! Shared-Memory Objects
//!
//! POSIX shared memory for overlay pixel buffers and forwarded keymaps.
//! Objects are created under a randomly drawn name and unlinked from the
//! namespace immediately after open, leaving the file descriptor as the
//! only handle. Truncation is retried on EINTR so a signal cannot leave a
//! zero-sized buffer behind.

use std::fs::File;
use std::os::fd::OwnedFd;

use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use thiserror::Error;

use crate::entropy::{EntropyError, EntropySource};

/// Namespace prefix of every shared-memory object this daemon creates.
pub const SHM_NAME_PREFIX: &str = "/kloak-";

/// Random letters appended to the prefix.
const SHM_NAME_RANDOM_LEN: usize = 10;

/// Attempts before giving up on a colliding namespace.
const SHM_CREATE_RETRIES: u32 = 100;

/// Shared-memory error types
#[derive(Error, Debug)]
pub enum ShmError {
    /// Every randomly named candidate already existed
    #[error("Could not create shared memory object after {0} attempts")]
    Exhausted(u32),

    /// shm_open failed for a reason other than a name collision
    #[error("Could not create shared memory object: {0}")]
    Create(Errno),

    /// Sizing the object failed
    #[error("Could not allocate shared memory block: {0}")]
    Truncate(Errno),

    /// Mapping the object into the address space failed
    #[error("Could not map shared memory block: {0}")]
    Map(std::io::Error),

    /// The random source failed while drawing a name
    #[error(transparent)]
    Entropy(#[from] EntropyError),
}

/// Draw a fresh shared-memory object name: the fixed prefix plus
/// `SHM_NAME_RANDOM_LEN` uniformly random ASCII letters.
pub fn generate_shm_name(entropy: &mut EntropySource) -> Result<String, ShmError> {
    let mut suffix = [0u8; SHM_NAME_RANDOM_LEN];
    entropy.fill_alpha(&mut suffix)?;
    let mut name = String::with_capacity(SHM_NAME_PREFIX.len() + SHM_NAME_RANDOM_LEN);
    name.push_str(SHM_NAME_PREFIX);
    name.push_str(std::str::from_utf8(&suffix).expect("letters are ASCII"));
    Ok(name)
}

/// Create an anonymous shared-memory file of `size` bytes.
///
/// The object is opened exclusively under a random name, unlinked right
/// away, and truncated to size with EINTR retried.
pub fn create_shm_file(size: u64, entropy: &mut EntropySource) -> Result<File, ShmError> {
    let mut attempts = SHM_CREATE_RETRIES;
    let fd: OwnedFd = loop {
        let name = generate_shm_name(entropy)?;
        attempts -= 1;
        match shm_open(
            name.as_str(),
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
            Mode::from_bits_truncate(0o600),
        ) {
            Ok(fd) => {
                // The fd is the only handle from here on.
                let _ = shm_unlink(name.as_str());
                break fd;
            }
            Err(Errno::EEXIST) if attempts > 0 => continue,
            Err(Errno::EEXIST) => return Err(ShmError::Exhausted(SHM_CREATE_RETRIES)),
            Err(errno) => return Err(ShmError::Create(errno)),
        }
    };

    loop {
        match ftruncate(&fd, size as i64) {
            Ok(()) => break,
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(ShmError::Truncate(errno)),
        }
    }

    Ok(File::from(fd))
}

/// Map a shared-memory file read-write.
pub fn map_mut(file: &File, size: usize) -> Result<MmapMut, ShmError> {
    unsafe { MmapOptions::new().len(size).map_mut(file) }.map_err(ShmError::Map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn test_generated_name_shape() {
        let mut entropy = EntropySource::open().unwrap();
        for _ in 0..1_000 {
            let name = generate_shm_name(&mut entropy).unwrap();
            assert_eq!(name.len(), SHM_NAME_PREFIX.len() + SHM_NAME_RANDOM_LEN);
            assert!(name.starts_with("/kloak-"));
            assert!(name["/kloak-".len()..]
                .bytes()
                .all(|byte| byte.is_ascii_alphabetic()));
        }
    }

    #[test]
    fn test_create_sized_object() {
        let mut entropy = EntropySource::open().unwrap();
        let file = create_shm_file(4096, &mut entropy).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 4096);
    }

    #[test]
    fn test_object_is_read_write() {
        let mut entropy = EntropySource::open().unwrap();
        let mut file = create_shm_file(16, &mut entropy).unwrap();

        file.write_all(b"0123456789abcdef").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut back = [0u8; 16];
        file.read_exact(&mut back).unwrap();
        assert_eq!(&back, b"0123456789abcdef");
    }

    #[test]
    fn test_mapping_reflects_writes() {
        let mut entropy = EntropySource::open().unwrap();
        let file = create_shm_file(64, &mut entropy).unwrap();
        let mut mapping = map_mut(&file, 64).unwrap();

        mapping[0..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&mapping[0..4], &[1, 2, 3, 4]);
    }
}
