mod common;

use std::fs;
use std::sync::mpsc;
use std::thread;

use common::{VaultFixture, stored_path};
use flint_core::{ExtractOptions, ProgressEvent, Vault};

#[test]
fn test_readers_see_consistent_snapshots_during_mutations() {
    let (fx, vault) = VaultFixture::new("pw");
    let seed = fx.source_file("seed.txt", b"seed");
    vault.add(&seed).unwrap();

    let sources: Vec<_> = (0..3)
        .map(|i| fx.source_file(&format!("extra-{i}.txt"), format!("payload {i}").as_bytes()))
        .collect();

    thread::scope(|scope| {
        for _ in 0..4 {
            let path = fx.vault_path.clone();
            scope.spawn(move || {
                let reader = Vault::open(&path, "pw").unwrap();
                for _ in 0..10 {
                    let entries = reader.list().unwrap();
                    // Every snapshot is one of the quiescent states: the
                    // seed entry plus zero to three extras.
                    assert!((1..=4).contains(&entries.len()));
                    for entry in &entries {
                        assert!(!entry.path.is_empty());
                    }
                }
            });
        }
        for source in &sources {
            vault.add(source).unwrap();
        }
    });

    assert_eq!(vault.list().unwrap().len(), 4);
}

#[test]
fn test_mutations_through_separate_handles_serialize() {
    let (fx, vault) = VaultFixture::new("pw");
    let a = fx.source_file("from-a.txt", b"A");
    let b = fx.source_file("from-b.txt", b"B");

    thread::scope(|scope| {
        let path = fx.vault_path.clone();
        let a = a.clone();
        scope.spawn(move || {
            Vault::open(&path, "pw").unwrap().add(&a).unwrap();
        });
        let path = fx.vault_path.clone();
        let b = b.clone();
        scope.spawn(move || {
            Vault::open(&path, "pw").unwrap().add(&b).unwrap();
        });
    });

    // Both adds survive regardless of which one won the lock first.
    let paths: Vec<String> = vault.list().unwrap().into_iter().map(|e| e.path).collect();
    assert!(paths.contains(&stored_path(&a)));
    assert!(paths.contains(&stored_path(&b)));
}

#[test]
fn test_parallel_extraction_matches_contents_and_reports_progress() {
    let (fx, vault) = VaultFixture::new("pw");
    let mut expected = Vec::new();
    for i in 0..8 {
        let contents: Vec<u8> = (0..50_000u32).map(|j| ((j * 13 + i * 7) % 251) as u8).collect();
        let source = fx.source_file(&format!("blob-{i}.bin"), &contents);
        vault.add(&source).unwrap();
        expected.push((stored_path(&source), contents));
    }

    let (tx, rx) = mpsc::channel();
    let out = fx.out_dir("par");
    let options = ExtractOptions {
        workers: 4,
        progress: Some(tx),
        ..ExtractOptions::default()
    };
    vault.extract_all(&out, &options).unwrap();
    drop(options);

    for (path, contents) in &expected {
        assert_eq!(&fs::read(out.join(path)).unwrap(), contents, "{path}");
    }

    let mut started = 0;
    let mut finished = 0;
    for event in rx.iter() {
        match event {
            ProgressEvent::Started { .. } => started += 1,
            ProgressEvent::Finished { .. } => finished += 1,
        }
    }
    assert_eq!(started, 8);
    assert_eq!(finished, 8);
}

#[test]
fn test_serial_and_parallel_extraction_agree() {
    let (fx, vault) = VaultFixture::new("pw");
    for i in 0..5 {
        let source = fx.source_file(&format!("f{i}.txt"), format!("contents {i}").as_bytes());
        vault.add(&source).unwrap();
    }

    let serial = fx.out_dir("serial");
    vault.extract_all(&serial, &ExtractOptions::default()).unwrap();

    let parallel = fx.out_dir("parallel");
    let options = ExtractOptions {
        workers: 3,
        ..ExtractOptions::default()
    };
    vault.extract_all(&parallel, &options).unwrap();

    for entry in vault.list().unwrap().iter().filter(|e| !e.is_dir) {
        assert_eq!(
            fs::read(serial.join(&entry.path)).unwrap(),
            fs::read(parallel.join(&entry.path)).unwrap(),
            "{}",
            entry.path
        );
    }
}
