//! Jar input and output.

use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::Path;

use log::{debug, trace};
use memmap::MmapOptions;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::classfile;
use crate::error::{Error, Result};
use crate::program::Program;

/// A non-class archive entry, carried through unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    pub data: Vec<u8>,
}

/// Decoded contents of a jar.
#[derive(Debug, Default)]
pub struct Archive {
    pub program: Program,
    pub resources: Vec<Resource>,
}

/// Reads every entry of the jar at `path`. Classes are decoded in entry name
/// order; everything else becomes a [`Resource`].
pub fn read_archive(path: &Path) -> Result<Archive> {
    let file = File::open(path).map_err(|err| Error::io(path, err))?;
    let mmap = unsafe { MmapOptions::new().map(&file) }.map_err(|err| Error::io(path, err))?;
    let mut zip = ZipArchive::new(Cursor::new(&mmap[..]))?;

    let mut entries = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .map_err(|err| Error::io(path.join(&name), err))?;
        entries.push(Resource { name, data });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    let mut archive = Archive::default();
    for entry in entries {
        if entry.name.ends_with(".class") {
            trace!("Decoding {}", entry.name);
            let class = classfile::decode(&entry.data).map_err(|err| match err {
                Error::ClassFormat { class, reason } if class == "?" => Error::ClassFormat {
                    class: entry.name.clone(),
                    reason,
                },
                err => err,
            })?;
            archive.program.classes.push(class);
        } else {
            archive.resources.push(entry);
        }
    }
    debug!(
        "Read {} classes and {} resources from {:?}",
        archive.program.classes.len(),
        archive.resources.len(),
        path
    );
    Ok(archive)
}

/// Encodes `program` and writes it with `resources` to a new jar at `path`.
/// Nothing is created unless every class encodes. The jar is assembled in a
/// temporary file next to `path` and renamed into place once complete.
pub fn write_archive(path: &Path, program: &Program, resources: &[Resource]) -> Result<()> {
    let mut classes = program
        .classes
        .iter()
        .map(|class| Ok((format!("{}.class", class.name), classfile::encode(class)?)))
        .collect::<Result<Vec<_>>>()?;
    classes.sort_by(|a, b| a.0.cmp(&b.0));

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let temp = tempfile::Builder::new()
        .prefix(".jdeob")
        .suffix(".jar")
        .tempfile_in(dir)
        .map_err(|err| Error::io(path, err))?;
    let mut zip = ZipWriter::new(temp);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let entries = classes
        .iter()
        .map(|(name, data)| (name.as_str(), data.as_slice()))
        .chain(resources.iter().map(|resource| (resource.name.as_str(), resource.data.as_slice())));
    for (name, data) in entries {
        zip.start_file(name, options)?;
        zip.write_all(data).map_err(|err| Error::io(path.join(name), err))?;
    }
    let temp = zip.finish()?;
    temp.persist(path).map_err(|err| Error::io(path, err.error))?;
    debug!("Wrote {} classes and {} resources to {:?}", classes.len(), resources.len(), path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{AccessFlags, ClassUnit, FieldUnit};

    fn program() -> Program {
        let mut b = ClassUnit::new("p/b", Some("java/lang/Object"), AccessFlags::PUBLIC);
        b.fields.push(FieldUnit::new("p/b", "count", "I", AccessFlags::STATIC));
        let a = ClassUnit::new("p/a", Some("p/b"), AccessFlags::PUBLIC);
        Program::new(vec![b, a])
    }

    #[test]
    fn jars_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jar");
        let manifest = Resource {
            name: "META-INF/MANIFEST.MF".to_string(),
            data: b"Manifest-Version: 1.0\n\n".to_vec(),
        };
        write_archive(&path, &program(), &[manifest.clone()]).unwrap();

        let archive = read_archive(&path).unwrap();
        let names: Vec<&str> = archive.program.classes.iter().map(|class| class.name.as_str()).collect();
        assert_eq!(names, vec!["p/a", "p/b"]);
        assert_eq!(archive.program.classes[0].super_name.as_deref(), Some("p/b"));
        assert!(archive.program.classes[1].field("count", "I").is_some());
        assert_eq!(archive.resources, vec![manifest]);
    }

    #[test]
    fn bad_classes_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jar");
        let mut program = program();
        program.classes[0].fields[0].descriptor = "I".repeat(70000);
        assert!(write_archive(&path, &program, &[]).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn failed_writes_keep_the_previous_jar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jar");
        write_archive(&path, &program(), &[]).unwrap();

        let duplicate = Resource {
            name: "data.bin".to_string(),
            data: vec![1, 2, 3],
        };
        let mut renamed = program();
        renamed.classes[0].name = "p/c".to_string();
        assert!(write_archive(&path, &renamed, &[duplicate.clone(), duplicate]).is_err());

        let archive = read_archive(&path).unwrap();
        let names: Vec<&str> = archive.program.classes.iter().map(|class| class.name.as_str()).collect();
        assert_eq!(names, vec!["p/a", "p/b"]);
        assert!(archive.resources.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn corrupt_classes_name_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.jar");
        let mut zip = ZipWriter::new(File::create(&path).unwrap());
        zip.start_file("broken.class", SimpleFileOptions::default()).unwrap();
        zip.write_all(&[0xca, 0xfe]).unwrap();
        zip.finish().unwrap();

        match read_archive(&path) {
            Err(Error::ClassFormat { class, .. }) => assert_eq!(class, "broken.class"),
            other => panic!("unexpected {:?}", other.map(|archive| archive.program.classes.len())),
        }
    }
}
