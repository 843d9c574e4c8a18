//! Integration test: tar.gz layer → ztoc → per-file extraction
//!
//! Builds a real layer with the tar and flate2 crates, indexes it at several
//! span sizes, and checks that every file decodes byte-for-byte from only the
//! spans it touches.

use std::collections::HashMap;
use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use seekpull_core::{ReadAt, Region, SeekpullResult};
use seekpull_ztoc::{build_ztoc, extract, EntryKind, LocalFile, Ztoc};
use tar::{EntryType, Header};

const SPAN_SIZES: [u64; 6] = [10_000, 65_535, 128_000, 256_000, 512_000, 1 << 20];

fn text(len: usize, seed: u32) -> Vec<u8> {
    const WORDS: [&[u8]; 8] = [
        b"layer ", b"span ", b"window ", b"offset ", b"registry ", b"blob ", b"\n", b"tar ",
    ];
    let mut x = seed | 1;
    let mut out = Vec::with_capacity(len + 16);
    while out.len() < len {
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        if x % 3 == 0 {
            out.extend_from_slice(WORDS[(x >> 8) as usize % WORDS.len()]);
        } else {
            out.push(b'a' + (x >> 4) as u8 % 26);
        }
    }
    out.truncate(len);
    out
}

fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut x = seed;
    (0..len)
        .map(|_| {
            x = x
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (x >> 56) as u8
        })
        .collect()
}

struct Layer {
    gz: Vec<u8>,
    files: HashMap<&'static str, Vec<u8>>,
}

fn build_layer(level: Compression) -> Layer {
    let files: Vec<(&'static str, Vec<u8>)> = vec![
        ("empty.txt", Vec::new()),
        ("etc/hostname", b"seekpull-test\n".to_vec()),
        ("usr/lib/big.bin", noise(600_000, 0x1234_5678)),
        ("usr/share/doc/readme", text(70_000, 0x0bad_cafe)),
        ("var/empty-again", Vec::new()),
        ("opt/mid.dat", text(250_000, 0x5eed_0001)),
    ];

    let mut builder = tar::Builder::new(Vec::new());
    for dir in ["etc/", "usr/", "usr/lib/"] {
        let mut h = Header::new_gnu();
        h.set_entry_type(EntryType::Directory);
        h.set_mode(0o755);
        h.set_size(0);
        builder.append_data(&mut h, dir, std::io::empty()).unwrap();
    }
    for (path, data) in &files {
        let mut h = Header::new_gnu();
        h.set_entry_type(EntryType::Regular);
        h.set_mode(0o644);
        h.set_size(data.len() as u64);
        builder.append_data(&mut h, path, data.as_slice()).unwrap();
    }
    let mut h = Header::new_gnu();
    h.set_entry_type(EntryType::Symlink);
    h.set_mode(0o777);
    h.set_size(0);
    builder
        .append_link(&mut h, "etc/host", "hostname")
        .unwrap();
    let tar = builder.into_inner().unwrap();

    let mut enc = GzEncoder::new(Vec::new(), level);
    enc.write_all(&tar).unwrap();
    Layer {
        gz: enc.finish().unwrap(),
        files: files.into_iter().collect(),
    }
}

/// Counts bytes requested so tests can see that only the needed spans are read.
struct CountingReader {
    data: Vec<u8>,
    requested: std::sync::Mutex<Vec<Region>>,
}

impl ReadAt for CountingReader {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> SeekpullResult<usize> {
        if !buf.is_empty() {
            self.requested
                .lock()
                .unwrap()
                .push(Region::new(offset, offset + buf.len() as u64 - 1));
        }
        self.data.read_at(buf, offset).await
    }
}

async fn check_all_files(ztoc: &Ztoc, layer: &Layer, span_size: u64) {
    for (path, expected) in &layer.files {
        let got = ztoc
            .extract_file(&layer.gz, path)
            .await
            .unwrap_or_else(|e| panic!("extract {path} at span size {span_size}: {e}"));
        assert_eq!(
            &got, expected,
            "{path} differs at span size {span_size}"
        );
    }
}

#[tokio::test]
async fn every_file_roundtrips_at_every_span_size() {
    let layer = build_layer(Compression::default());
    for span_size in SPAN_SIZES {
        let ztoc = build_ztoc(layer.gz.as_slice(), span_size).unwrap();
        assert_eq!(ztoc.index.compressed_size(), layer.gz.len() as u64);
        check_all_files(&ztoc, &layer, span_size).await;
    }
}

#[tokio::test]
async fn stored_blocks_roundtrip() {
    let layer = build_layer(Compression::none());
    let ztoc = build_ztoc(layer.gz.as_slice(), 65_535).unwrap();
    assert!(ztoc.index.span_count() > 4);
    check_all_files(&ztoc, &layer, 65_535).await;
}

#[test]
fn toc_records_entries() {
    let layer = build_layer(Compression::default());
    let ztoc = build_ztoc(layer.gz.as_slice(), 65_535).unwrap();

    let dir = ztoc.lookup("./usr/lib/").unwrap();
    assert_eq!(dir.kind, EntryKind::Dir);
    assert_eq!(dir.mode, 0o755);

    let link = ztoc.lookup("etc/host").unwrap();
    assert_eq!(link.kind, EntryKind::Symlink);
    assert_eq!(link.link_name.as_deref(), Some("hostname"));

    let big = ztoc.lookup("/usr/lib/big.bin").unwrap();
    assert_eq!(big.kind, EntryKind::File);
    assert_eq!(big.uncompressed_size, 600_000);
    assert_eq!(big.uncompressed_offset % 512, 0);

    let empty = ztoc.lookup("empty.txt").unwrap();
    assert_eq!(empty.uncompressed_size, 0);
    assert_eq!(empty.span_start, empty.span_end);

    assert!(ztoc.lookup("nope").is_none());
}

#[tokio::test]
async fn large_file_covers_many_spans_and_reads_only_those() {
    let layer = build_layer(Compression::default());
    let ztoc = build_ztoc(layer.gz.as_slice(), 10_000).unwrap();

    let big = ztoc.lookup("usr/lib/big.bin").unwrap();
    assert!(
        big.span_end - big.span_start >= 10,
        "expected 10+ spans, got {}..={}",
        big.span_start,
        big.span_end
    );
    assert!(
        ztoc.index.checkpoints().iter().any(|c| c.bit_offset > 0),
        "compressed layer should have unaligned checkpoints"
    );

    let reader = CountingReader {
        data: layer.gz.clone(),
        requested: Default::default(),
    };
    let hostname = ztoc.lookup("etc/hostname").unwrap();
    let got = extract(&reader, &ztoc.index, &hostname.metadata())
        .await
        .unwrap();
    assert_eq!(got, b"seekpull-test\n");

    let requested: u64 = reader
        .requested
        .lock()
        .unwrap()
        .iter()
        .map(Region::size)
        .sum();
    assert!(
        requested < layer.gz.len() as u64 / 4,
        "small file pulled {requested} of {} compressed bytes",
        layer.gz.len()
    );
}

#[tokio::test]
async fn zero_length_files_fetch_nothing() {
    let layer = build_layer(Compression::default());
    let ztoc = build_ztoc(layer.gz.as_slice(), 10_000).unwrap();
    let reader = CountingReader {
        data: layer.gz.clone(),
        requested: Default::default(),
    };
    for path in ["empty.txt", "var/empty-again"] {
        let entry = ztoc.lookup(path).unwrap();
        let got = extract(&reader, &ztoc.index, &entry.metadata())
            .await
            .unwrap();
        assert!(got.is_empty());
    }
    assert!(reader.requested.lock().unwrap().is_empty());
}

#[test]
fn index_building_is_deterministic() {
    let layer = build_layer(Compression::default());
    let a = build_ztoc(layer.gz.as_slice(), 128_000).unwrap();
    let b = build_ztoc(layer.gz.as_slice(), 128_000).unwrap();
    assert_eq!(a.to_bytes(), b.to_bytes());
    assert_eq!(a.digest(), b.digest());
}

#[tokio::test]
async fn serialized_ztoc_extracts_from_local_file() {
    let tmp = tempfile::TempDir::new().unwrap();
    let layer = build_layer(Compression::default());
    let layer_path = tmp.path().join("layer.tar.gz");
    std::fs::write(&layer_path, &layer.gz).unwrap();

    let built = build_ztoc(layer.gz.as_slice(), 65_535).unwrap();
    let ztoc_path = tmp.path().join("layer.ztoc");
    std::fs::write(&ztoc_path, built.to_bytes()).unwrap();

    let loaded = Ztoc::from_bytes(&std::fs::read(&ztoc_path).unwrap()).unwrap();
    assert_eq!(loaded, built);

    let file = LocalFile::open(&layer_path).unwrap();
    for (path, expected) in &layer.files {
        let got = loaded.extract_file(&file, path).await.unwrap();
        assert_eq!(&got, expected, "{path}");
    }
}

#[tokio::test]
async fn extracting_a_directory_is_rejected() {
    let layer = build_layer(Compression::default());
    let ztoc = build_ztoc(layer.gz.as_slice(), 65_535).unwrap();
    assert!(ztoc.extract_file(&layer.gz, "usr").await.is_err());
    assert!(ztoc.extract_file(&layer.gz, "missing").await.is_err());
}
