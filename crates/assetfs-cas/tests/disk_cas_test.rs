use std::fs;
use std::io::{Read, Write};

use tempfile::TempDir;

use assetfs_cas::{
    BlobChecker, BlobData, BlobReader, BlobWriter, CancelToken, DiskCas, Error, ImportSource,
    LocalCas, StatusCode,
};
use assetfs_integrity::{Algorithm, Digest, Integrity};

const ALGO: Algorithm = Algorithm::Sha256;

fn digest_of(data: &[u8]) -> Digest {
    ALGO.digest_of_bytes(data)
}

#[test]
fn layout_is_created_and_staging_cleared() {
    let temp = TempDir::new().unwrap();

    // Simulate a leftover staging file from a crashed process.
    let staging = temp.path().join("sha256/staging");
    fs::create_dir_all(&staging).unwrap();
    fs::write(staging.join("deadbeef-1"), b"partial").unwrap();

    let cas = DiskCas::new(temp.path()).unwrap();

    for algorithm in Algorithm::ALL {
        assert!(cas.root().join(algorithm.name()).join("cas/00").is_dir());
        assert!(cas.root().join(algorithm.name()).join("cas/ff").is_dir());
        assert!(cas.root().join(algorithm.name()).join("staging").is_dir());
    }
    assert_eq!(fs::read_dir(&staging).unwrap().count(), 0);
}

#[test]
fn write_stream_commit_promotes_blob() {
    let temp = TempDir::new().unwrap();
    let cas = DiskCas::new(temp.path()).unwrap();
    let cancel = CancelToken::new();

    let data = b"hello world\n";
    let digest = digest_of(data);

    let mut sink = cas.write_stream(&cancel, &digest, ALGO).unwrap();
    sink.write_all(data).unwrap();
    sink.commit().unwrap();

    // Blob lands at <root>/sha256/cas/<hh>/<hex> with the right size.
    let hex = digest.hex(ALGO);
    let path = temp
        .path()
        .join("sha256/cas")
        .join(&hex[..2])
        .join(&hex);
    assert!(path.is_file());
    assert_eq!(fs::read(&path).unwrap(), data);

    assert!(cas
        .find_missing_blobs(&cancel, &[digest], ALGO)
        .unwrap()
        .is_empty());
    // Staging directory left clean.
    assert_eq!(
        fs::read_dir(temp.path().join("sha256/staging")).unwrap().count(),
        0
    );
}

#[test]
fn commit_rejects_corrupt_content_and_discards_staging() {
    let temp = TempDir::new().unwrap();
    let cas = DiskCas::new(temp.path()).unwrap();
    let cancel = CancelToken::new();

    let digest = digest_of(b"expected content");
    let mut sink = cas.write_stream(&cancel, &digest, ALGO).unwrap();
    sink.write_all(b"corrupted content").unwrap();
    let err = sink.commit().unwrap_err();
    assert!(matches!(err, Error::ShortOrLongRead { .. }));

    // Same size, different bytes: digest mismatch.
    let digest = digest_of(b"expected content");
    let mut sink = cas.write_stream(&cancel, &digest, ALGO).unwrap();
    sink.write_all(b"eXpected content").unwrap();
    let err = sink.commit().unwrap_err();
    assert!(matches!(err, Error::ChecksumMismatch { .. }));

    assert_eq!(
        cas.find_missing_blobs(&cancel, &[digest], ALGO).unwrap().len(),
        1
    );
    assert_eq!(
        fs::read_dir(temp.path().join("sha256/staging")).unwrap().count(),
        0
    );
}

#[test]
fn dropped_writer_cleans_up_staging() {
    let temp = TempDir::new().unwrap();
    let cas = DiskCas::new(temp.path()).unwrap();
    let cancel = CancelToken::new();

    let digest = digest_of(b"never committed");
    let mut sink = cas.write_stream(&cancel, &digest, ALGO).unwrap();
    sink.write_all(b"never").unwrap();
    drop(sink);

    assert_eq!(
        fs::read_dir(temp.path().join("sha256/staging")).unwrap().count(),
        0
    );
}

#[test]
fn find_missing_reports_directory_as_corruption() {
    let temp = TempDir::new().unwrap();
    let cas = DiskCas::new(temp.path()).unwrap();
    let cancel = CancelToken::new();

    let digest = digest_of(b"data");
    let hex = digest.hex(ALGO);
    let blob_path = temp.path().join("sha256/cas").join(&hex[..2]).join(&hex);
    fs::create_dir(&blob_path).unwrap();

    let err = cas.find_missing_blobs(&cancel, &[digest], ALGO).unwrap_err();
    assert!(matches!(err, Error::CacheCorrupt(_)));
}

#[test]
fn batch_read_reports_per_entry_status() {
    let temp = TempDir::new().unwrap();
    let cas = DiskCas::new(temp.path()).unwrap();
    let cancel = CancelToken::new();

    let present = digest_of(b"present");
    let absent = digest_of(b"absent");
    cas.batch_update_blobs(
        &cancel,
        &[BlobData {
            digest: present,
            data: b"present".to_vec(),
        }],
        ALGO,
    )
    .unwrap()
    .into_ok()
    .unwrap();

    let outcome = cas
        .batch_read_blobs(&cancel, &[present, absent], ALGO)
        .unwrap();
    assert!(outcome.has_failures());
    assert_eq!(outcome.responses.len(), 2);
    assert_eq!(outcome.responses[0].status.code, StatusCode::Ok);
    assert_eq!(outcome.responses[0].data.as_deref(), Some(&b"present"[..]));
    assert_eq!(outcome.responses[1].status.code, StatusCode::NotFound);
    assert!(matches!(outcome.into_ok(), Err(Error::BatchStatus)));
}

#[test]
fn batch_update_rejects_corrupt_entry_but_keeps_going() {
    let temp = TempDir::new().unwrap();
    let cas = DiskCas::new(temp.path()).unwrap();
    let cancel = CancelToken::new();

    let good = digest_of(b"good");
    let bad = digest_of(b"bad");
    let outcome = cas
        .batch_update_blobs(
            &cancel,
            &[
                BlobData {
                    digest: good,
                    data: b"good".to_vec(),
                },
                BlobData {
                    digest: bad,
                    data: b"BAD".to_vec(),
                },
            ],
            ALGO,
        )
        .unwrap();

    assert!(outcome.has_failures());
    assert_eq!(outcome.responses[0].status.code, StatusCode::Ok);
    assert_eq!(
        outcome.responses[1].status.code,
        StatusCode::FailedPrecondition
    );
    // The good blob was still stored.
    assert!(cas
        .find_missing_blobs(&cancel, &[good], ALGO)
        .unwrap()
        .is_empty());
}

#[test]
fn read_stream_honors_offset_and_limit() {
    let temp = TempDir::new().unwrap();
    let cas = DiskCas::new(temp.path()).unwrap();
    let cancel = CancelToken::new();

    let data = b"0123456789";
    let digest = digest_of(data);
    let mut sink = cas.write_stream(&cancel, &digest, ALGO).unwrap();
    sink.write_all(data).unwrap();
    sink.commit().unwrap();

    let mut out = Vec::new();
    cas.read_stream(&cancel, &digest, ALGO, 2, 5)
        .unwrap()
        .read_to_end(&mut out)
        .unwrap();
    assert_eq!(out, b"23456");

    // limit == 0 reads to EOF.
    let mut out = Vec::new();
    cas.read_stream(&cancel, &digest, ALGO, 7, 0)
        .unwrap()
        .read_to_end(&mut out)
        .unwrap();
    assert_eq!(out, b"789");

    assert!(matches!(
        cas.read_stream(&cancel, &digest_of(b"missing"), ALGO, 0, 0),
        Err(Error::NotFound { .. })
    ));
}

#[test]
fn random_access_reads_are_positional() {
    let temp = TempDir::new().unwrap();
    let cas = DiskCas::new(temp.path()).unwrap();
    let cancel = CancelToken::new();

    let data = b"abcdefghij";
    let digest = digest_of(data);
    let mut sink = cas.write_stream(&cancel, &digest, ALGO).unwrap();
    sink.write_all(data).unwrap();
    sink.commit().unwrap();

    let reader = cas.read_random_access(&cancel, &digest, ALGO, 0, 0).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(reader.read_at(&mut buf, 3).unwrap(), 4);
    assert_eq!(&buf, b"defg");
    // Out-of-order positional reads do not disturb each other.
    assert_eq!(reader.read_at(&mut buf, 0).unwrap(), 4);
    assert_eq!(&buf, b"abcd");
    // Reads past EOF are short.
    assert_eq!(reader.read_at(&mut buf, 8).unwrap(), 2);
    assert_eq!(&buf[..2], b"ij");
    assert_eq!(reader.read_at(&mut buf, 20).unwrap(), 0);

    // A limited window caps reads at offset + limit.
    let limited = cas.read_random_access(&cancel, &digest, ALGO, 2, 5).unwrap();
    assert_eq!(limited.read_at(&mut buf, 5).unwrap(), 2);
    assert_eq!(&buf[..2], b"fg");
    assert_eq!(limited.read_at(&mut buf, 7).unwrap(), 0);
}

#[test]
fn import_blob_from_file_and_reader() {
    let temp = TempDir::new().unwrap();
    let cas = DiskCas::new(temp.path()).unwrap();
    let cancel = CancelToken::new();

    let data = b"imported bytes";
    let digest = digest_of(data);
    let integrity = Integrity::from_checksums([digest.checksum(ALGO)]);

    // File-backed source on the same volume as the store: hardlinked.
    let source_path = temp.path().join("download");
    fs::write(&source_path, data).unwrap();
    let imported = cas
        .import_blob(
            &cancel,
            &integrity,
            None,
            ALGO,
            ImportSource::File(source_path),
        )
        .unwrap();
    assert!(imported.equals(&digest, ALGO));
    assert!(cas
        .find_missing_blobs(&cancel, &[digest], ALGO)
        .unwrap()
        .is_empty());

    // Reader-backed source, known digest supplied directly.
    let data2 = b"streamed bytes";
    let digest2 = digest_of(data2);
    let imported = cas
        .import_blob(
            &cancel,
            &Integrity::default(),
            Some(digest2),
            ALGO,
            ImportSource::Reader(Box::new(std::io::Cursor::new(data2.to_vec()))),
        )
        .unwrap();
    assert!(imported.equals(&digest2, ALGO));

    // No validated checksum at all: refused.
    let err = cas
        .import_blob(
            &cancel,
            &Integrity::default(),
            None,
            ALGO,
            ImportSource::Reader(Box::new(std::io::Cursor::new(Vec::new()))),
        )
        .unwrap_err();
    assert!(matches!(err, Error::MissingChecksum));
}

#[test]
fn import_blob_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let cas = DiskCas::new(temp.path()).unwrap();
    let cancel = CancelToken::new();

    let data = b"same bytes";
    let digest = digest_of(data);
    let source = temp.path().join("src");
    fs::write(&source, data).unwrap();

    for _ in 0..2 {
        let imported = cas
            .import_blob(
                &cancel,
                &Integrity::default(),
                Some(digest),
                ALGO,
                ImportSource::File(source.clone()),
            )
            .unwrap();
        assert!(imported.equals(&digest, ALGO));
    }
}

#[test]
fn cancelled_token_aborts_operations() {
    let temp = TempDir::new().unwrap();
    let cas = DiskCas::new(temp.path()).unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();

    let digest = digest_of(b"x");
    assert!(matches!(
        cas.find_missing_blobs(&cancel, &[digest], ALGO),
        Err(Error::Cancelled)
    ));
    assert!(matches!(
        cas.read_stream(&cancel, &digest, ALGO, 0, 0),
        Err(Error::Cancelled)
    ));
}
