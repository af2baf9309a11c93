//! Source listing and append-mode growth tracking.
//!
//! A foreign table's `file_path` may point at a single file, a directory
//! of files, or a `.tar` archive. Delimited entries may additionally be
//! gzip-compressed. Listing yields a deterministic, name-ordered entry
//! sequence so fragment numbering is stable across scans.

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use strata_common::{Error, Result};

/// One readable unit of a source
#[derive(Clone, Debug)]
pub struct SourceEntry {
    /// Bare name used in user-facing messages and the append ledger
    pub name: String,
    /// File on disk holding the bytes (the archive itself for members)
    pub path: PathBuf,
    /// Member path inside the archive, when the source is one
    pub member: Option<String>,
    pub byte_size: u64,
}

fn open_error(path: &Path, source: std::io::Error) -> Error {
    Error::SourceUnavailable {
        path: path.display().to_string(),
        source,
    }
}

fn is_archive(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "tar")
}

/// Enumerate the entries of a source location, name-ordered
pub fn list_source(root: &Path) -> Result<Vec<SourceEntry>> {
    let metadata = std::fs::metadata(root).map_err(|e| open_error(root, e))?;

    if metadata.is_dir() {
        let mut entries = Vec::new();
        for dir_entry in std::fs::read_dir(root).map_err(|e| open_error(root, e))? {
            let dir_entry = dir_entry.map_err(|e| open_error(root, e))?;
            let path = dir_entry.path();
            let name = dir_entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !path.is_file() {
                continue;
            }
            let size = dir_entry.metadata().map_err(|e| open_error(&path, e))?.len();
            entries.push(SourceEntry {
                name,
                path,
                member: None,
                byte_size: size,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        return Ok(entries);
    }

    if is_archive(root) {
        let file = File::open(root).map_err(|e| open_error(root, e))?;
        let mut archive = tar::Archive::new(BufReader::new(file));
        let mut entries = Vec::new();
        for member in archive.entries().map_err(|e| open_error(root, e))? {
            let member = member.map_err(|e| open_error(root, e))?;
            if !member.header().entry_type().is_file() {
                continue;
            }
            let member_path = member
                .path()
                .map_err(|e| open_error(root, e))?
                .to_string_lossy()
                .to_string();
            let name = member_path
                .rsplit('/')
                .next()
                .unwrap_or(&member_path)
                .to_string();
            entries.push(SourceEntry {
                name,
                path: root.to_path_buf(),
                member: Some(member_path),
                byte_size: member.size(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        return Ok(entries);
    }

    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| root.display().to_string());
    Ok(vec![SourceEntry {
        name,
        path: root.to_path_buf(),
        member: None,
        byte_size: metadata.len(),
    }])
}

/// Open one entry for reading, transparently decompressing `.gz` names
pub fn open_entry(entry: &SourceEntry) -> Result<Box<dyn Read>> {
    let raw: Box<dyn Read> = match &entry.member {
        None => {
            let file = File::open(&entry.path).map_err(|e| open_error(&entry.path, e))?;
            Box::new(BufReader::new(file))
        }
        Some(member_path) => {
            let file = File::open(&entry.path).map_err(|e| open_error(&entry.path, e))?;
            let mut archive = tar::Archive::new(BufReader::new(file));
            let mut contents = None;
            for member in archive.entries().map_err(|e| open_error(&entry.path, e))? {
                let mut member = member.map_err(|e| open_error(&entry.path, e))?;
                let path = member
                    .path()
                    .map_err(|e| open_error(&entry.path, e))?
                    .to_string_lossy()
                    .to_string();
                if path == *member_path {
                    let mut bytes = Vec::with_capacity(member.size() as usize);
                    member
                        .read_to_end(&mut bytes)
                        .map_err(|e| open_error(&entry.path, e))?;
                    contents = Some(bytes);
                    break;
                }
            }
            let bytes = contents.ok_or_else(|| Error::CorruptSource {
                path: entry.path.display().to_string(),
                reason: format!("archive member \"{member_path}\" disappeared mid-read"),
            })?;
            Box::new(Cursor::new(bytes))
        }
    };

    if entry.name.ends_with(".gz") {
        Ok(Box::new(GzDecoder::new(raw)))
    } else {
        Ok(raw)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct LedgerEntry {
    name: String,
    /// Bare name of the archive this entry came from, if any
    archive: Option<String>,
    byte_size: u64,
}

/// Append-mode growth ledger: the set of source entries observed by the
/// last scan, with byte sizes. A rescan under append mode must only ever
/// see these entries grow.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SourceLedger {
    entries: Vec<LedgerEntry>,
}

impl SourceLedger {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Verify the append growth invariants of `current` against this
    /// ledger: no previously-observed entry may be missing or smaller.
    pub fn check_append_growth(&self, current: &[SourceEntry]) -> Result<()> {
        for previous in &self.entries {
            let found = current.iter().find(|e| e.name == previous.name);
            match found {
                None => {
                    if let Some(archive) = &previous.archive {
                        return Err(Error::AppendArchiveEntryMissing {
                            entry: previous.name.clone(),
                            archive: archive.clone(),
                        });
                    }
                    return Err(Error::AppendShrank {
                        path: previous.name.clone(),
                    });
                }
                Some(entry) if entry.byte_size < previous.byte_size => {
                    return Err(Error::AppendShrank {
                        path: previous.name.clone(),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Record the outcome of a completed scan
    pub fn record(&mut self, entries: &[SourceEntry]) {
        self.entries = entries
            .iter()
            .map(|e| LedgerEntry {
                name: e.name.clone(),
                archive: e.member.as_ref().map(|_| {
                    e.path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| e.path.display().to_string())
                }),
                byte_size: e.byte_size,
            })
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn entry(name: &str, size: u64) -> SourceEntry {
        SourceEntry {
            name: name.to_string(),
            path: PathBuf::from(name),
            member: None,
            byte_size: size,
        }
    }

    #[test]
    fn test_list_single_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, "1\n2\n").unwrap();
        let entries = list_source(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "data.csv");
        assert_eq!(entries[0].byte_size, 4);
    }

    #[test]
    fn test_list_directory_is_sorted() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.csv"), "2\n").unwrap();
        std::fs::write(dir.path().join("a.csv"), "1\n").unwrap();
        std::fs::write(dir.path().join(".hidden"), "x").unwrap();
        let entries = list_source(dir.path()).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.csv", "b.csv"]);
    }

    #[test]
    fn test_list_and_read_archive() {
        let dir = TempDir::new().unwrap();
        let archive_path = dir.path().join("data.tar");
        {
            let file = File::create(&archive_path).unwrap();
            let mut builder = tar::Builder::new(file);
            let mut header = tar::Header::new_gnu();
            header.set_size(4);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "rows.csv", "1\n2\n".as_bytes())
                .unwrap();
            builder.finish().unwrap();
        }

        let entries = list_source(&archive_path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "rows.csv");
        assert_eq!(entries[0].member.as_deref(), Some("rows.csv"));

        let mut contents = String::new();
        open_entry(&entries[0])
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "1\n2\n");
    }

    #[test]
    fn test_read_gzip_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.csv.gz");
        {
            let file = File::create(&path).unwrap();
            let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            encoder.write_all(b"5\n").unwrap();
            encoder.finish().unwrap();
        }
        let entries = list_source(&path).unwrap();
        let mut contents = String::new();
        open_entry(&entries[0])
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "5\n");
    }

    #[test]
    fn test_missing_source() {
        let err = list_source(Path::new("/nonexistent/source.csv")).unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable { .. }));
        assert!(err.to_string().contains("/nonexistent/source.csv"));
    }

    #[test]
    fn test_ledger_growth_checks() {
        let mut ledger = SourceLedger::default();
        ledger.record(&[entry("a.csv", 10), entry("b.csv", 5)]);

        ledger
            .check_append_growth(&[entry("a.csv", 12), entry("b.csv", 5), entry("c.csv", 1)])
            .unwrap();

        let err = ledger
            .check_append_growth(&[entry("a.csv", 8), entry("b.csv", 5)])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Refresh of foreign table created with APPEND update mode failed as \
             file reduced in size: \"a.csv\"."
        );

        let err = ledger
            .check_append_growth(&[entry("a.csv", 10)])
            .unwrap_err();
        assert!(matches!(err, Error::AppendShrank { .. }));
    }

    #[test]
    fn test_ledger_missing_archive_member() {
        let mut ledger = SourceLedger::default();
        let member = SourceEntry {
            name: "rows.csv".to_string(),
            path: PathBuf::from("/data/archive.tar"),
            member: Some("rows.csv".to_string()),
            byte_size: 4,
        };
        ledger.record(&[member]);

        let err = ledger.check_append_growth(&[]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Foreign table refreshed with APPEND mode missing archive entry \
             \"rows.csv\" from file \"archive.tar\"."
        );
    }
}
