use crate::error::SessionError;
use crate::transfer::constants::{MAX_FILENAME_LENGTH, MAX_FILE_SIZE};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};

const FALLBACK_NAME: &str = "received_file";

const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Check a file against the share limits before it is offered
pub fn validate_share(file_name: &str, file_size: u64) -> Result<(), SessionError> {
    if file_size > MAX_FILE_SIZE {
        return Err(SessionError::FileTooLarge {
            size: file_size,
            max: MAX_FILE_SIZE,
        });
    }
    if file_name.len() > MAX_FILENAME_LENGTH {
        return Err(SessionError::FileNameTooLong {
            len: file_name.len(),
            max: MAX_FILENAME_LENGTH,
        });
    }
    Ok(())
}

/// Turn a remote-supplied name into something safe to create inside the download directory.
///
/// Directory components are stripped, control characters dropped, Windows device
/// names and dot-names replaced, and over-long names cut while keeping a short extension.
pub fn sanitize_file_name(file_name: &str) -> String {
    let last = file_name.rsplit(['/', '\\']).next().unwrap_or_default();
    let clean: String = last.chars().filter(|c| !c.is_control()).collect();

    let stem = clean.split('.').next().unwrap_or_default();
    if clean.trim().is_empty()
        || clean == "."
        || clean == ".."
        || RESERVED_NAMES.iter().any(|r| stem.eq_ignore_ascii_case(r))
    {
        return FALLBACK_NAME.to_string();
    }

    if clean.len() <= MAX_FILENAME_LENGTH {
        return clean;
    }

    match clean.rfind('.') {
        Some(idx) if clean.len() - idx < 20 => {
            let ext = &clean[idx..];
            let mut base = clean[..idx].to_string();
            truncate_at_boundary(&mut base, MAX_FILENAME_LENGTH - ext.len());
            base + ext
        }
        _ => {
            let mut name = clean;
            truncate_at_boundary(&mut name, MAX_FILENAME_LENGTH);
            name
        }
    }
}

fn truncate_at_boundary(s: &mut String, max: usize) {
    let mut cut = max.min(s.len());
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

/// Path inside `dir` for a received file
pub fn download_target(dir: &Path, remote_name: &str) -> PathBuf {
    dir.join(sanitize_file_name(remote_name))
}

/// Create (or truncate) a file readable only by the owner on Unix
pub async fn open_secure_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}

/// Human readable byte count
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\notes.txt"), "notes.txt");
        assert_eq!(sanitize_file_name("dir/"), FALLBACK_NAME);
        assert_eq!(sanitize_file_name(".."), FALLBACK_NAME);
    }

    #[test]
    fn test_sanitize_reserved_and_control() {
        assert_eq!(sanitize_file_name("CON"), FALLBACK_NAME);
        assert_eq!(sanitize_file_name("nul.txt"), FALLBACK_NAME);
        assert_eq!(sanitize_file_name("a\u{0007}b.bin"), "ab.bin");
        assert_eq!(sanitize_file_name("console.log"), "console.log");
    }

    #[test]
    fn test_sanitize_truncates_keeping_extension() {
        let long = format!("{}.tar.gz", "x".repeat(400));
        let clean = sanitize_file_name(&long);
        assert_eq!(clean.len(), MAX_FILENAME_LENGTH);
        assert!(clean.ends_with(".gz"));

        let multibyte = "é".repeat(300);
        let clean = sanitize_file_name(&multibyte);
        assert!(clean.len() <= MAX_FILENAME_LENGTH);
        assert!(clean.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_validate_share_limits() {
        assert!(validate_share("ok.txt", 10).is_ok());
        assert!(matches!(
            validate_share("big.iso", MAX_FILE_SIZE + 1),
            Err(SessionError::FileTooLarge { .. })
        ));
        assert!(matches!(
            validate_share(&"n".repeat(MAX_FILENAME_LENGTH + 1), 1),
            Err(SessionError::FileNameTooLong { .. })
        ));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(100_000), "97.7 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[tokio::test]
    async fn test_secure_file_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = download_target(dir.path(), "../sneaky.txt");
        assert_eq!(path, dir.path().join("sneaky.txt"));

        let _file = open_secure_file(&path).await.unwrap();
        assert!(path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
