//! The persisted name table.
//!
//! One mapping per line: `old=new` renames, `old=owner,name` renames and moves a
//! static member into `owner`. Anything after `#` is a comment. Class keys are
//! internal names (`a` or `pkg/a`), field keys are `owner.name:descriptor` and
//! method keys are `owner.namedescriptor`.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use log::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mapping {
    Rename(String),
    Relocate { owner: String, name: String },
}

impl Mapping {
    /// The new simple name, whether or not the member moves.
    pub fn name(&self) -> &str {
        match self {
            Mapping::Rename(name) => name,
            Mapping::Relocate { name, .. } => name,
        }
    }

    pub fn owner(&self) -> Option<&str> {
        match self {
            Mapping::Rename(_) => None,
            Mapping::Relocate { owner, .. } => Some(owner),
        }
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mapping::Rename(name) => f.write_str(name),
            Mapping::Relocate { owner, name } => write!(f, "{},{}", owner, name),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NameTable {
    entries: BTreeMap<String, Mapping>,
}

impl NameTable {
    pub fn new() -> NameTable {
        NameTable::default()
    }

    /// Parses table text. Malformed lines are reported and skipped.
    pub fn parse(text: &str) -> NameTable {
        let mut table = NameTable::new();
        for (index, line) in text.lines().enumerate() {
            match parse_line(line) {
                Ok(Some((key, mapping))) => {
                    table.entries.insert(key, mapping);
                }
                Ok(None) => {}
                Err(reason) => warn!(
                    "{}, skipping",
                    Error::NameTable {
                        line: index + 1,
                        reason,
                    }
                ),
            }
        }
        table
    }

    /// Reads the table at `path`. A missing file is an empty table.
    pub fn read(path: &Path) -> Result<NameTable> {
        match fs::read_to_string(path) {
            Ok(text) => {
                let table = NameTable::parse(&text);
                debug!("Read {} name table entries from {:?}", table.len(), path);
                Ok(table)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("No name table at {:?}, starting empty", path);
                Ok(NameTable::new())
            }
            Err(err) => Err(Error::io(path, err)),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_string()).map_err(|err| Error::io(path, err))
    }

    pub fn get(&self, key: &str) -> Option<&Mapping> {
        self.entries.get(key)
    }

    /// Adds an entry unless `key` is already mapped. Existing entries always win.
    pub fn insert(&mut self, key: String, mapping: Mapping) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, mapping);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Mapping)> {
        self.entries.iter().map(|(key, mapping)| (key.as_str(), mapping))
    }

    /// Highest `N` among generated names of the form `{prefix}N`, so fresh
    /// names never collide with ones already handed out.
    pub fn highest_counter(&self, prefix: &str) -> usize {
        self.entries
            .values()
            .filter_map(|mapping| {
                let name = mapping.name();
                let simple = &name[name.rfind('/').map_or(0, |pos| pos + 1)..];
                simple.strip_prefix(prefix)?.parse::<usize>().ok()
            })
            .max()
            .unwrap_or(0)
    }
}

impl fmt::Display for NameTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, mapping) in &self.entries {
            writeln!(f, "{}={}", key, mapping)?;
        }
        Ok(())
    }
}

fn parse_line(line: &str) -> std::result::Result<Option<(String, Mapping)>, String> {
    let line = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let line = line.trim();
    if line.is_empty() || line.ends_with('=') {
        return Ok(None);
    }

    let (key, value) = line
        .split_once('=')
        .ok_or_else(|| format!("missing `=` in `{}`", line))?;
    let key = key.trim();
    let value = value.trim();
    if key.is_empty() {
        return Err(format!("empty key in `{}`", line));
    }
    if value.contains('=') {
        return Err(format!("more than one `=` in `{}`", line));
    }

    let class_entry = !key.contains('.');
    let key = key.to_string();

    let mapping = match value.split_once(',') {
        Some((owner, name)) => {
            let (owner, name) = (owner.trim(), name.trim());
            if class_entry {
                return Err(format!("class `{}` cannot be relocated", key));
            }
            if owner.is_empty() || name.is_empty() || name.contains(',') {
                return Err(format!("malformed relocation `{}`", value));
            }
            Mapping::Relocate {
                owner: owner.replace('.', "/"),
                name: name.to_string(),
            }
        }
        None if class_entry => Mapping::Rename(value.replace('.', "/")),
        None => Mapping::Rename(value.to_string()),
    };
    Ok(Some((key, mapping)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
# classes
a=deob.Client
bk=pkg/Node   # trailing comment

bk.c:I=count
bk.d(I)V=Statics,reset
ignored=
broken line
x.y(I)V=,name
";

    #[test]
    fn parses_renames_and_relocations() {
        let table = NameTable::parse(TABLE);
        assert_eq!(table.len(), 4);
        assert_eq!(table.get("a"), Some(&Mapping::Rename("deob/Client".to_string())));
        assert_eq!(table.get("bk"), Some(&Mapping::Rename("pkg/Node".to_string())));
        assert_eq!(table.get("bk.c:I"), Some(&Mapping::Rename("count".to_string())));
        assert_eq!(
            table.get("bk.d(I)V"),
            Some(&Mapping::Relocate {
                owner: "Statics".to_string(),
                name: "reset".to_string(),
            })
        );
        assert!(table.get("ignored").is_none());
    }

    #[test]
    fn class_keys_are_kept_verbatim() {
        let table = NameTable::parse("pkg/a=deob.b\npkg/c=deob/d,e\n");
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("pkg/a"), Some(&Mapping::Rename("deob/b".to_string())));
        assert!(table.get("pkg/c").is_none());
    }

    #[test]
    fn written_table_reads_back() {
        let table = NameTable::parse(TABLE);
        let text = table.to_string();
        assert!(text.starts_with("a=deob/Client\n"));
        assert_eq!(NameTable::parse(&text), table);
    }

    #[test]
    fn existing_entries_win() {
        let mut table = NameTable::parse("a=class7\n");
        assert!(!table.insert("a".to_string(), Mapping::Rename("class1".to_string())));
        assert!(table.insert("b".to_string(), Mapping::Rename("class8".to_string())));
        assert_eq!(table.highest_counter("class"), 8);
        assert_eq!(table.highest_counter("field"), 0);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remap.txt");
        assert!(NameTable::read(&path).unwrap().is_empty());

        let table = NameTable::parse(TABLE);
        table.write(&path).unwrap();
        assert_eq!(NameTable::read(&path).unwrap(), table);
    }
}
