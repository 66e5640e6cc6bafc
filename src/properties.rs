use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::io::Write;
use std::path::Path;

/// Reads a `key=value` file. `Ok(None)` if the file does not exist.
pub(crate) fn read_properties(path: &Path) -> io::Result<Option<BTreeMap<String, String>>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut properties = BTreeMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => {
                properties.insert(key.trim().to_string(), value.trim().to_string());
            }
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Malformed line in {}: {}", path.display(), line),
                ))
            }
        }
    }

    Ok(Some(properties))
}

/// Writes the properties to a sibling temp file, syncs it, then renames it over `path`.
pub(crate) fn write_properties_atomically(path: &Path, properties: &[(&str, String)]) -> io::Result<()> {
    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");
    let tmp_path = Path::new(&tmp_path);

    {
        let mut file = fs::File::create(tmp_path)?;
        writeln!(file, "# {}", chrono::Utc::now().to_rfc2822())?;
        for (key, value) in properties {
            writeln!(file, "{}={}", key, value)?;
        }
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)
}

#[cfg(test)]
pub(crate) fn unique_temp_dir(prefix: &str) -> std::path::PathBuf {
    use rand::Rng;

    let dir = std::env::temp_dir().join(format!(
        "{}-{}-{}",
        prefix,
        chrono::Utc::now().format("%Y%m%dT%H%M%S"),
        rand::thread_rng().gen::<u32>()
    ));
    fs::create_dir_all(&dir).expect("temp dir");
    dir
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_skips_the_timestamp_comment() {
        let dir = unique_temp_dir("properties");
        let path = dir.join("state.properties");

        assert!(read_properties(&path).unwrap().is_none());

        write_properties_atomically(&path, &[("a", "1".to_string()), ("b", "x=y".to_string())]).unwrap();
        let read = read_properties(&path).unwrap().unwrap();

        assert_eq!(read.get("a").map(String::as_str), Some("1"));
        assert_eq!(read.get("b").map(String::as_str), Some("x=y"));
        assert_eq!(read.len(), 2);
        assert!(!dir.join("state.properties.tmp").exists());
    }
}
