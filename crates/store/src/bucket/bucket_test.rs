use super::*;

use tempfile::TempDir;

fn file_bucket_store(dir: &TempDir, options: StoreOptions) -> BucketStore {
    let mut store = BucketStore::new(StoreContext::default(), "web", false);
    store.configure(&options.with_section(
        "bucket",
        StoreOptions::new()
            .with_str("type", "file")
            .with_str("file_path", dir.path().to_string_lossy())
            .with_bool("add_newlines", true),
    ));
    store
}

fn batch(payloads: &[&str]) -> MessageBatch {
    payloads
        .iter()
        .map(|p| LogEntry::new("web", p.as_bytes().to_vec()))
        .collect()
}

/// Lines written by the child for bucket `index`, or empty if it never
/// opened a file.
fn bucket_lines(dir: &TempDir, index: usize) -> Vec<String> {
    let prefix = format!("web_{:03}_", index);
    let mut lines = Vec::new();
    for entry in std::fs::read_dir(dir.path()).expect("read_dir") {
        let entry = entry.expect("entry");
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && !name.ends_with("_stats") {
            let content = std::fs::read_to_string(entry.path()).expect("read");
            lines.extend(content.lines().map(str::to_string));
        }
    }
    lines
}

// =============================================================================
// Bucketizers
// =============================================================================

#[test]
fn key_modulo_routes_by_integer() {
    let dir = TempDir::new().expect("tempdir");
    let store = file_bucket_store(
        &dir,
        StoreOptions::new()
            .with_int("num_buckets", 4)
            .with_str("bucket_type", "key_modulo")
            .with_str("delimiter", "\t"),
    );

    for i in 0..12u64 {
        let message = format!("{i}\tpayload");
        assert_eq!(
            store.bucketize(message.as_bytes()),
            (i % 4) as usize,
            "key {i}"
        );
    }
}

#[test]
fn key_modulo_unparseable_goes_to_zero() {
    let dir = TempDir::new().expect("tempdir");
    let store = file_bucket_store(
        &dir,
        StoreOptions::new()
            .with_int("num_buckets", 4)
            .with_str("bucket_type", "key_modulo")
            .with_str("delimiter", "\t"),
    );

    assert_eq!(store.bucketize(b"not-a-number\tpayload"), 0);
    assert_eq!(store.bucketize(b"\tpayload"), 0);
}

#[test]
fn no_delimiter_is_an_orphan() {
    let dir = TempDir::new().expect("tempdir");
    for bucket_type in ["key_hash", "key_modulo", "context_log"] {
        let store = file_bucket_store(
            &dir,
            StoreOptions::new()
                .with_int("num_buckets", 8)
                .with_str("bucket_type", bucket_type)
                .with_str("delimiter", "\t"),
        );
        assert_eq!(store.bucketize(b"no delimiter here"), 0, "{bucket_type}");
    }
}

#[test]
fn key_hash_is_stable_and_spread() {
    let dir = TempDir::new().expect("tempdir");
    let store = file_bucket_store(
        &dir,
        StoreOptions::new()
            .with_int("num_buckets", 4)
            .with_str("delimiter", ":"),
    );

    // Same key, same bucket, every time
    let bucket = store.bucketize(b"user42:event");
    for _ in 0..5 {
        assert_eq!(store.bucketize(b"user42:event"), bucket);
    }
    // Matches the advertised function
    assert_eq!(bucket, (fnv1a(b"user42") % 4) as usize);
}

#[test]
fn context_log_uses_trailing_ordinal() {
    let dir = TempDir::new().expect("tempdir");
    let store = file_bucket_store(
        &dir,
        StoreOptions::new()
            .with_int("num_buckets", 4)
            .with_str("bucket_type", "context_log")
            .with_str("delimiter", "\t"),
    );

    assert_eq!(store.bucketize(b"session:6\tpayload"), 2);
    assert_eq!(store.bucketize(b"shard:13\tpayload"), 1);
    // No ordinal: falls back to hashing the whole key
    assert_eq!(
        store.bucketize(b"plain\tpayload"),
        (fnv1a(b"plain") % 4) as usize
    );
}

// =============================================================================
// Routing end to end
// =============================================================================

#[tokio::test]
async fn partitions_land_in_their_buckets() {
    let dir = TempDir::new().expect("tempdir");
    let mut store = file_bucket_store(
        &dir,
        StoreOptions::new()
            .with_int("num_buckets", 4)
            .with_str("bucket_type", "key_modulo")
            .with_str("delimiter", "\t"),
    );
    assert!(store.open().await, "open failed: {}", store.status());

    let result = store
        .handle_messages(batch(&["0\tzero", "1\tone", "2\ttwo", "5\tfive", "junk\tmystery"]))
        .await;
    assert!(result.is_complete());
    store.flush().await;
    store.close().await;

    assert_eq!(bucket_lines(&dir, 0), vec!["0\tzero", "junk\tmystery"]);
    assert_eq!(bucket_lines(&dir, 1), vec!["1\tone", "5\tfive"]);
    assert_eq!(bucket_lines(&dir, 2), vec!["2\ttwo"]);
    assert!(bucket_lines(&dir, 3).is_empty());
}

#[tokio::test]
async fn remove_key_strips_before_forwarding() {
    let dir = TempDir::new().expect("tempdir");
    let mut store = file_bucket_store(
        &dir,
        StoreOptions::new()
            .with_int("num_buckets", 4)
            .with_str("bucket_type", "key_hash")
            .with_str("delimiter", "\t")
            .with_bool("remove_key", true),
    );
    assert!(store.open().await);

    let inputs = ["alpha\tX", "beta\tY", "\tZ", "gamma\tW"];
    assert!(store.handle_messages(batch(&inputs)).await.is_complete());
    store.flush().await;
    store.close().await;

    // Every payload arrives keyless in the bucket its key hashes to
    for (key, payload) in [("alpha", "X"), ("beta", "Y"), ("", "Z"), ("gamma", "W")] {
        let bucket = (fnv1a(key.as_bytes()) % 4) as usize;
        assert!(
            bucket_lines(&dir, bucket).contains(&payload.to_string()),
            "payload {payload} missing from bucket {bucket}"
        );
    }
}

#[tokio::test]
async fn orphans_keep_their_whole_message() {
    let dir = TempDir::new().expect("tempdir");
    let mut store = file_bucket_store(
        &dir,
        StoreOptions::new()
            .with_int("num_buckets", 2)
            .with_str("delimiter", "\t")
            .with_bool("remove_key", true),
    );
    assert!(store.open().await);

    assert!(store.handle_messages(batch(&["no delimiter"])).await.is_complete());
    store.flush().await;
    store.close().await;

    assert_eq!(bucket_lines(&dir, 0), vec!["no delimiter"]);
}

#[tokio::test]
async fn order_preserved_within_a_bucket() {
    let dir = TempDir::new().expect("tempdir");
    let mut store = file_bucket_store(
        &dir,
        StoreOptions::new()
            .with_int("num_buckets", 2)
            .with_str("bucket_type", "key_modulo")
            .with_str("delimiter", "\t"),
    );
    assert!(store.open().await);

    let inputs: Vec<String> = (0..10).map(|i| format!("{}\tmsg{i}", i % 2)).collect();
    let refs: Vec<&str> = inputs.iter().map(|s| s.as_str()).collect();
    assert!(store.handle_messages(batch(&refs)).await.is_complete());
    store.flush().await;
    store.close().await;

    let even: Vec<String> = (0..10).step_by(2).map(|i| format!("0\tmsg{i}")).collect();
    assert_eq!(bucket_lines(&dir, 0), even);
}

// =============================================================================
// Configuration
// =============================================================================

#[tokio::test]
async fn missing_num_buckets_is_fatal() {
    let dir = TempDir::new().expect("tempdir");
    let mut store = file_bucket_store(&dir, StoreOptions::new());
    assert!(!store.open().await);
    assert!(store.status().contains("misconfigured"));
}

#[tokio::test]
async fn bad_bucket_type_is_fatal() {
    let dir = TempDir::new().expect("tempdir");
    let mut store = file_bucket_store(
        &dir,
        StoreOptions::new()
            .with_int("num_buckets", 2)
            .with_str("bucket_type", "astrology"),
    );
    assert!(!store.open().await);
}

#[tokio::test]
async fn multibyte_delimiter_is_fatal() {
    let dir = TempDir::new().expect("tempdir");
    let mut store = file_bucket_store(
        &dir,
        StoreOptions::new()
            .with_int("num_buckets", 2)
            .with_str("delimiter", "::"),
    );
    assert!(!store.open().await);
}

#[tokio::test]
async fn missing_model_is_fatal() {
    let mut store = BucketStore::new(StoreContext::default(), "web", false);
    store.configure(&StoreOptions::new().with_int("num_buckets", 2));
    assert!(!store.open().await);
    assert!(store.status().contains("misconfigured"));
}
