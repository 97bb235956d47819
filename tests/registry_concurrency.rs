//! Two writers sharing one registry file.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use taglink::{RegistryFile, TagRegistry};
use tempfile::tempdir;

fn pair(tag: &str) -> (String, String) {
    (format!("[[{}]]", tag), tag.to_string())
}

#[test]
fn test_uncoordinated_saves_lose_an_update() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ner_tags.json");
    let first = RegistryFile::new(&path);
    let second = RegistryFile::new(&path);

    // Both editors load before either writes
    let mut a = first.load();
    let mut b = second.load();

    a.merge([pair("Einstein")]);
    first.save(&a).unwrap();

    b.merge([pair("Bohr")]);
    second.save(&b).unwrap();

    let disk = RegistryFile::new(&path).try_load().unwrap();
    assert!(disk.contains("[[Bohr]]"));
    assert!(!disk.contains("[[Einstein]]"), "save is last-writer-wins");
}

#[test]
fn test_synced_writers_keep_both_updates() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ner_tags.json");
    let first = RegistryFile::new(&path);
    let second = RegistryFile::new(&path);

    let mut a = first.load();
    let mut b = second.load();

    a.merge([pair("Einstein")]);
    first.sync(&mut a).unwrap();

    b.merge([pair("Bohr")]);
    let adopted = second.sync(&mut b).unwrap();

    assert_eq!(adopted, 1);
    assert_eq!(b.resolve("[[Einstein]]"), Some("Einstein"));

    let disk = RegistryFile::new(&path).try_load().unwrap();
    assert!(disk.contains("[[Einstein]]"));
    assert!(disk.contains("[[Bohr]]"));
}

#[test]
fn test_parallel_syncs_from_threads() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ner_tags.json");
    let names = ["Curie", "Planck", "Dirac", "Noether", "Fermi", "Meitner"];
    let barrier = Arc::new(Barrier::new(names.len()));

    let handles: Vec<_> = names
        .iter()
        .map(|name| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            let name = name.to_string();
            thread::spawn(move || {
                let file = RegistryFile::new(&path).with_lock_policy(400, Duration::from_millis(5));
                let mut registry = TagRegistry::new();
                registry.merge([pair(&name)]);
                barrier.wait();
                file.sync(&mut registry).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let disk = RegistryFile::new(&path).try_load().unwrap();
    assert_eq!(disk.len(), names.len());
    for name in names {
        assert_eq!(disk.resolve(&format!("[[{}]]", name)), Some(name));
    }
}

#[test]
fn test_removal_is_not_resurrected_by_other_writer() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ner_tags.json");
    let file = RegistryFile::new(&path);

    let mut seed = TagRegistry::new();
    seed.merge([pair("Einstein"), pair("Bohr")]);
    file.sync(&mut seed).unwrap();

    let mut a = file.load();
    let mut b = file.load();

    a.remove("[[Bohr]]");
    file.sync(&mut a).unwrap();

    // b never saw the removal but has no local change to Bohr either
    b.merge([pair("Dirac")]);
    file.sync(&mut b).unwrap();

    let disk = file.try_load().unwrap();
    assert!(!disk.contains("[[Bohr]]"));
    assert!(disk.contains("[[Einstein]]"));
    assert!(disk.contains("[[Dirac]]"));
}

#[test]
fn test_extracted_tag_never_overwrites_explicit_edit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ner_tags.json");
    let file = RegistryFile::new(&path);

    let mut a = file.load();
    let mut b = file.load();

    b.set("[[Einstein]]", "Albert Einstein");
    file.sync(&mut b).unwrap();

    // a extracted the same name before it saw b's edit
    assert_eq!(a.merge([pair("Einstein")]), 1);
    file.sync(&mut a).unwrap();

    assert_eq!(a.resolve("[[Einstein]]"), Some("Albert Einstein"));
    let disk = file.try_load().unwrap();
    assert_eq!(disk.resolve("[[Einstein]]"), Some("Albert Einstein"));
}
