//! End to end scans of small synthetic inputs

use filkarv_core::config::ScanEnvironment;
use filkarv_core::meta_directory::MetaDirectory;
use filkarv_core::scheduler::ScanReport;
use filkarv_types::ExtractedSpan;
use pretty_assertions::assert_eq;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Scan {
    _dir: TempDir,
    unpack_root: std::path::PathBuf,
    report: ScanReport,
}

impl Scan {
    fn md(&self, name: &str) -> MetaDirectory {
        MetaDirectory::open(&self.unpack_root, name).expect("open meta-directory")
    }

    fn root(&self) -> MetaDirectory {
        self.md("root")
    }

    fn bytes_of(&self, md: &MetaDirectory) -> Vec<u8> {
        std::fs::read(md.abs_file_path()).expect("read unpacked bytes")
    }
}

fn scan_named(file_name: &str, data: &[u8]) -> Scan {
    let dir = tempfile::tempdir().expect("tempdir");
    let input_dir = dir.path().join("input");
    std::fs::create_dir(&input_dir).expect("mkdir");
    let input = input_dir.join(file_name);
    std::fs::write(&input, data).expect("write input");

    let unpack_root = dir.path().join("unpack");
    let env = ScanEnvironment::builder()
        .unpack_directory(unpack_root.clone())
        .temporary_directory(dir.path().join("tmp"))
        .job_wait_time(Duration::from_millis(50))
        .workers(2)
        .build()
        .expect("env");
    let report = filkarv_core::scan(Arc::new(env), &input).expect("scan");
    assert_eq!(report.failed_jobs, 0, "no job may fail");
    Scan {
        _dir: dir,
        unpack_root,
        report,
    }
}

fn gzip_bytes(data: &[u8], name: Option<&str>) -> Vec<u8> {
    let mut builder = flate2::GzBuilder::new();
    if let Some(name) = name {
        builder = builder.filename(name);
    }
    let mut encoder = builder.write(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).expect("compress");
    encoder.finish().expect("finish")
}

fn has_labels(md: &MetaDirectory, expected: &[&str]) -> bool {
    expected.iter().all(|label| md.info().has_label(label))
}

#[test]
fn test_single_gzip() {
    let scan = scan_named("hello.gz", &gzip_bytes(b"hello\n", None));
    let root = scan.root();
    assert!(
        has_labels(&root, &["gzip", "archive"]),
        "root labels: {:?}",
        root.info().labels
    );

    let child_name = root
        .info()
        .unpacked_relative_files
        .get("hello")
        .expect("unpacked child named after the stem");
    let child = scan.md(child_name);
    assert_eq!(scan.bytes_of(&child), b"hello\n");
    assert!(has_labels(&child, &["text"]));
    assert_eq!(scan.report.jobs, 2);
}

#[test]
fn test_gzip_fname_field_names_the_output() {
    let scan = scan_named("data.bin.gz", &gzip_bytes(b"content\n", Some("original_name")));
    let root = scan.root();
    assert!(
        has_labels(&root, &["gzip", "archive", "renamed"]),
        "root labels: {:?}",
        root.info().labels
    );
    let child_name = root
        .info()
        .unpacked_relative_files
        .get("original_name")
        .expect("FNAME wins over the stem");
    let child = scan.md(child_name);
    assert_eq!(scan.bytes_of(&child), b"content\n");
}

#[test]
fn test_concatenated_gzips() {
    let first = gzip_bytes(b"hello\n", None);
    let second = gzip_bytes(b"world\n", None);
    let mut data = first.clone();
    data.extend_from_slice(&second);

    let scan = scan_named("double", &data);
    let root = scan.root();
    // Not a single whole-file parse: two carved spans instead
    assert!(!root.info().has_label("gzip"));

    let spans: Vec<_> = root.info().extracted_files.keys().copied().collect();
    assert_eq!(
        spans,
        vec![
            ExtractedSpan::new(0, first.len() as u64),
            ExtractedSpan::new(first.len() as u64, second.len() as u64),
        ]
    );
    for (span, child_name) in &root.info().extracted_files {
        let child = scan.md(child_name);
        assert!(
            has_labels(&child, &["gzip", "archive"]),
            "span {span} labels: {:?}",
            child.info().labels
        );
    }
}

#[test]
fn test_gzip_with_leading_noise() {
    let payload = gzip_bytes(b"hi\n", None);
    let mut data = vec![0xaa; 20];
    data.extend_from_slice(&payload);

    let scan = scan_named("noisy", &data);
    let root = scan.root();

    let spans: Vec<_> = root.info().extracted_files.keys().copied().collect();
    assert_eq!(
        spans,
        vec![
            ExtractedSpan::new(0, 20),
            ExtractedSpan::new(20, payload.len() as u64),
        ]
    );
    let gap = scan.md(&root.info().extracted_files[&ExtractedSpan::new(0, 20)]);
    // 0xaa fill is not zero bytes, so not padding
    assert!(has_labels(&gap, &["synthesized"]));
    assert!(!gap.info().has_label("padding"));

    let carved = scan.md(&root.info().extracted_files[&ExtractedSpan::new(20, payload.len() as u64)]);
    assert!(has_labels(&carved, &["gzip"]));
    assert_eq!(scan.bytes_of(&carved), payload);

    // The carved child unpacked its content in turn
    let inner_name = carved
        .info()
        .unpacked_relative_files
        .values()
        .next()
        .expect("gzip content unpacked");
    assert_eq!(scan.bytes_of(&scan.md(inner_name)), b"hi\n");
}

#[test]
fn test_zero_fill_gap_is_padding() {
    let payload = gzip_bytes(b"hi\n", None);
    let mut data = vec![0x00; 20];
    data.extend_from_slice(&payload);

    let scan = scan_named("padded", &data);
    let root = scan.root();
    let gap = scan.md(&root.info().extracted_files[&ExtractedSpan::new(0, 20)]);
    assert!(has_labels(&gap, &["padding"]));
}

#[test]
fn test_tar_of_three_files() {
    let mut builder = tar::Builder::new(Vec::new());
    let mut dir_header = tar::Header::new_ustar();
    dir_header.set_entry_type(tar::EntryType::Directory);
    dir_header.set_size(0);
    dir_header.set_mode(0o755);
    builder.append_data(&mut dir_header, "b", &b""[..]).expect("dir");
    for (name, data) in [
        ("a.txt", &b"first\n"[..]),
        ("b/c.txt", b"second\n"),
        ("b/d.txt", b"third\n"),
    ] {
        let mut header = tar::Header::new_ustar();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, data).expect("append");
    }
    let data = builder.into_inner().expect("finish");

    let scan = scan_named("three.tar", &data);
    let root = scan.root();
    assert!(has_labels(&root, &["tar", "archive"]));
    assert_eq!(root.info().unpacked_relative_files.len(), 3);
    assert!(root.info().unpacked_directories.contains("b"));

    let c = scan.md(&root.info().unpacked_relative_files["b/c.txt"]);
    assert_eq!(scan.bytes_of(&c), b"second\n");
    assert!(has_labels(&c, &["text"]));
}

#[test]
fn test_truncated_gzip_falls_through() {
    // A member header with no payload at all
    let data = [0x1f, 0x8b, 0x08, 0x00, 0, 0, 0, 0, 0x00, 0x03];
    let scan = scan_named("broken.bin", &data);
    let root = scan.root();
    assert!(!root.info().has_label("gzip"));
    assert!(has_labels(&root, &["binary"]));
    assert!(root.info().extracted_files.is_empty());
    assert_eq!(scan.report.jobs, 1);
}

#[test]
fn test_encrypted_sevenzip() {
    let scan = scan_named("secret.7z", &encrypted_sevenzip());
    let root = scan.root();
    assert!(
        has_labels(&root, &["7z", "archive", "compressed", "encrypted"]),
        "root labels: {:?}",
        root.info().labels
    );
    assert!(root.info().unpacked_relative_files.is_empty());
    assert!(root.info().unpacked_absolute_files.is_empty());
}

#[test]
fn test_empty_file() {
    let scan = scan_named("empty", b"");
    let root = scan.root();
    assert!(has_labels(&root, &["empty"]));
    assert!(root.info().extracted_files.is_empty());
    assert_eq!(scan.report.jobs, 1);
}

#[test]
fn test_single_byte_file() {
    let scan = scan_named("one", b"A");
    assert!(has_labels(&scan.root(), &["text"]));

    let scan = scan_named("one.bin", &[0x01]);
    assert!(has_labels(&scan.root(), &["binary"]));
}

#[test]
fn test_pure_padding_file() {
    let scan = scan_named("zeros", &[0u8; 4096]);
    let root = scan.root();
    assert!(has_labels(&root, &["padding", "binary"]));
    assert!(root.info().extracted_files.is_empty());
}

#[test]
fn test_intel_hex_via_featureless_pass() {
    // No extension and no signature anywhere: only the featureless pass
    // can identify this
    let data = b":0B0010006164647265737320676170A7\n:00000001FF\n";
    let scan = scan_named("firmware_dump", data);
    let root = scan.root();
    assert!(
        has_labels(&root, &["ihex", "text"]),
        "root labels: {:?}",
        root.info().labels
    );
    let inner = root
        .info()
        .unpacked_relative_files
        .values()
        .next()
        .expect("decoded image");
    assert_eq!(scan.bytes_of(&scan.md(inner)), b"address gap");
}

#[test]
fn test_duplicate_content_is_scanned_once() {
    let mut builder = tar::Builder::new(Vec::new());
    for name in ["first.txt", "second.txt"] {
        let mut header = tar::Header::new_ustar();
        header.set_size(5);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, &b"same\n"[..]).expect("append");
    }
    let data = builder.into_inner().expect("finish");

    // One worker makes the processing order deterministic
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("dup.tar");
    std::fs::write(&input, &data).expect("write input");
    let unpack_root = dir.path().join("unpack");
    let env = ScanEnvironment::builder()
        .unpack_directory(unpack_root.clone())
        .temporary_directory(dir.path().join("tmp"))
        .job_wait_time(Duration::from_millis(50))
        .workers(1)
        .build()
        .expect("env");
    filkarv_core::scan(Arc::new(env), &input).expect("scan");

    let root = MetaDirectory::open(&unpack_root, "root").expect("root");
    let first = MetaDirectory::open(
        &unpack_root,
        &root.info().unpacked_relative_files["first.txt"],
    )
    .expect("first");
    let second = MetaDirectory::open(
        &unpack_root,
        &root.info().unpacked_relative_files["second.txt"],
    )
    .expect("second");
    assert!(!first.info().has_label("duplicate"));
    assert!(second.info().has_label("duplicate"));
    assert_eq!(
        second.info().metadata.get("duplicate_of"),
        Some(&serde_cbor::Value::Text(first.name().to_owned()))
    );
}

#[test]
fn test_nested_containers() {
    // A gzip holding a tar holding a text file, named so the stem rules
    // produce inner.tar for the middle layer
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_ustar();
    header.set_size(6);
    header.set_mode(0o644);
    builder.append_data(&mut header, "inner.txt", &b"nested"[..]).expect("append");
    let tar_data = builder.into_inner().expect("finish");
    let data = gzip_bytes(&tar_data, None);

    let scan = scan_named("inner.tgz", &data);
    let root = scan.root();
    assert!(has_labels(&root, &["gzip", "archive"]));

    let tar_md = scan.md(&root.info().unpacked_relative_files["inner.tar"]);
    assert!(has_labels(&tar_md, &["tar", "archive"]));

    let inner = scan.md(&tar_md.info().unpacked_relative_files["inner.txt"]);
    assert_eq!(scan.bytes_of(&inner), b"nested");
    assert!(has_labels(&inner, &["text"]));
}

#[test]
fn test_path_traversal_stays_inside_unpack_root() {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_ustar();
    header.set_size(4);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, "nested/../../../../escape.txt", &b"out!"[..])
        .expect("append");
    let data = builder.into_inner().expect("finish");

    let scan = scan_named("evil.tar", &data);
    let root = scan.root();
    for child_name in root.info().unpacked_relative_files.values() {
        let child = scan.md(child_name);
        assert!(
            child.abs_file_path().starts_with(&scan.unpack_root),
            "{:?} escaped the unpack root",
            child.abs_file_path()
        );
    }
}

/// A structurally valid 7z whose (encoded) header advertises the AES
/// coder, the layout password protected archives have.
fn encrypted_sevenzip() -> Vec<u8> {
    fn crc32(data: &[u8]) -> u32 {
        let mut crc = flate2::Crc::new();
        crc.update(data);
        crc.sum()
    }

    let next_header: Vec<u8> = vec![
        0x17, 0x06, 0x01, 0x00, 0x01, 0x0b, 0x01, 0x00, 0x07, 0x06, 0xf1, 0x07, 0x01, 0x01,
        0x00, 0x0c, 0x00,
    ];
    let payload = [0x55u8; 12];

    let mut start_header = Vec::new();
    start_header.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    start_header.extend_from_slice(&(next_header.len() as u64).to_le_bytes());
    start_header.extend_from_slice(&crc32(&next_header).to_le_bytes());

    let mut data = Vec::new();
    data.extend_from_slice(b"7z\xbc\xaf\x27\x1c");
    data.extend_from_slice(&[0x00, 0x04]);
    data.extend_from_slice(&crc32(&start_header).to_le_bytes());
    data.extend_from_slice(&start_header);
    data.extend_from_slice(&payload);
    data.extend_from_slice(&next_header);
    data
}
