use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::Path;

use super::error::SharedFileError;

/// FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE
#[cfg(target_family = "windows")]
const SHARE_ALL: u32 = 0x7;

/// Open without locking out other readers or writers on windows
#[cfg(target_family = "windows")]
fn open_shared(path: &Path) -> std::io::Result<File> {
    use std::os::windows::fs::OpenOptionsExt;
    OpenOptions::new().read(true).share_mode(SHARE_ALL).open(path)
}

/// Unix opens never take a mandatory lock
#[cfg(target_family = "unix")]
fn open_shared(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().read(true).open(path)
}

/// Read a whole file that the machine or planning system may still be writing to
pub fn read_shared(path: &Path) -> Result<Vec<u8>, SharedFileError> {
    if !path.exists() {
        return Err(SharedFileError::BadFilePath(path.to_path_buf()));
    }
    let mut file = open_shared(path)?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;
    Ok(contents)
}

/// Read a shared text file, replacing invalid UTF-8
pub fn read_shared_to_string(path: &Path) -> Result<String, SharedFileError> {
    let contents = read_shared(path)?;
    Ok(String::from_utf8_lossy(&contents).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_while_open_for_writing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"control point\r\n").unwrap();
        file.flush().unwrap();

        assert_eq!(read_shared(file.path()).unwrap(), b"control point\r\n");
        assert_eq!(
            read_shared_to_string(file.path()).unwrap(),
            "control point\r\n"
        );
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            read_shared(Path::new("/no/such/tel.1")),
            Err(SharedFileError::BadFilePath(_))
        ));
    }
}
