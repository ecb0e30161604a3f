//! Disk accounting properties: the concurrent directory walk must agree
//! with a sequential count, and the cache must honor its TTL semantics.

use std::path::Path;
use std::time::Duration;

use roost_sftp::quota::{directory_size, QuotaCache};
use tempfile::TempDir;
use tokio::fs;

/// Sequential reference implementation to compare the parallel walk
/// against.
fn sequential_size(path: &Path) -> u64 {
    let mut total = 0;
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            total += sequential_size(&entry.path());
        } else if file_type.is_file() {
            total += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    total
}

async fn build_tree(root: &Path, fanout: usize, depth: usize) {
    let mut pending = vec![(root.to_path_buf(), depth)];

    while let Some((dir, remaining)) = pending.pop() {
        for d in 0..fanout {
            let subdir = dir.join(format!("dir{d}"));
            fs::create_dir_all(&subdir).await.unwrap();
            for f in 0..fanout {
                fs::write(subdir.join(format!("file{f}.bin")), vec![0u8; 100 * (f + 1)])
                    .await
                    .unwrap();
            }
            if remaining > 0 {
                pending.push((subdir, remaining - 1));
            }
        }
    }
}

#[tokio::test]
async fn test_concurrent_walk_matches_sequential_walk() {
    let temp = TempDir::new().unwrap();
    build_tree(temp.path(), 4, 3).await;

    let expected = sequential_size(temp.path());
    assert!(expected > 0);

    // No lost updates: repeated concurrent walks all agree with the
    // sequential count.
    for _ in 0..5 {
        assert_eq!(directory_size(temp.path()).await, expected);
    }
}

#[tokio::test]
async fn test_symlinks_do_not_count() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("real.bin"), vec![0u8; 512])
        .await
        .unwrap();
    fs::symlink(temp.path().join("real.bin"), temp.path().join("alias.bin"))
        .await
        .unwrap();

    assert_eq!(directory_size(temp.path()).await, 512);
}

#[tokio::test]
async fn test_limit_refreshes_after_ttl() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("server.json");
    let data = temp.path().join("data");
    fs::create_dir_all(&data).await.unwrap();
    fs::write(data.join("fill.bin"), vec![0u8; 2 * 1_048_576])
        .await
        .unwrap();

    fs::write(&config, br#"{"build": {"disk": 1}}"#).await.unwrap();

    let cache = QuotaCache::with_ttl(Duration::from_millis(20), false);
    assert!(!cache.has_space("t", &data, &config).await);

    // The control plane raises the allowance; once the cached entries
    // expire the new limit takes effect.
    fs::write(&config, br#"{"build": {"disk": 100}}"#).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(cache.has_space("t", &data, &config).await);
}

#[tokio::test]
async fn test_usage_growth_invisible_until_expiry() {
    let temp = TempDir::new().unwrap();
    let config = temp.path().join("server.json");
    let data = temp.path().join("data");
    fs::create_dir_all(&data).await.unwrap();
    fs::write(&config, br#"{"build": {"disk": 1}}"#).await.unwrap();

    let cache = QuotaCache::new(false);
    // Empty tenant: allowed, and the zero usage is cached.
    assert!(cache.has_space("t", &data, &config).await);

    // Tenant blows past the limit; the cached value keeps answering until
    // its TTL runs out. Quota is eventually consistent by design.
    fs::write(data.join("fill.bin"), vec![0u8; 3 * 1_048_576])
        .await
        .unwrap();
    assert!(cache.has_space("t", &data, &config).await);
}
