//! End-to-end behavior of the native store: single-writer sessions,
//! concurrent writers, crash orphans, eager flushing, reloads.

use futures::TryStreamExt;
use shardlist_path::UPath;
use shardlist_store::{ListOptions, ShardList};
use uuid::Uuid;

fn scratch(name: &str) -> UPath {
    UPath::memory(&format!("store-tests/{name}/{}", Uuid::new_v4()))
}

fn options(batch_size: usize) -> ListOptions {
    ListOptions {
        batch_size,
        ..ListOptions::default()
    }
}

#[tokio::test]
async fn single_writer_append_flush_reopen() {
    let root = scratch("single-writer");
    let mut list: ShardList<i64> = ShardList::new(Some(root.clone()), options(100))
        .await
        .unwrap();
    for i in 0..10_023i64 {
        list.append(i).await.unwrap();
    }
    list.flush().await.unwrap();

    let reader: ShardList<i64> = ShardList::open(root).await.unwrap();
    assert_eq!(reader.len(), 10_023);
    // 100 full batches flushed implicitly plus the 23-element tail.
    assert_eq!(reader.num_data_files(), 101);

    let sum: i64 = reader
        .stream()
        .try_fold(0i64, |acc, x| async move { Ok(acc + x) })
        .await
        .unwrap();
    assert_eq!(sum, 50_225_253);

    assert_eq!(reader.get(18).await.unwrap(), 18);
    assert_eq!(reader.get(-3).await.unwrap(), 10_020);
    assert!(reader.get(10_023).await.is_err());
}

#[tokio::test]
async fn indexed_access_matches_iteration() {
    let root = scratch("index-vs-iter");
    let mut list: ShardList<i64> = ShardList::new(Some(root.clone()), options(7))
        .await
        .unwrap();
    list.extend((0..100).map(|i| i * 3)).await.unwrap();
    list.flush().await.unwrap();

    let streamed: Vec<i64> = list.stream().try_collect().await.unwrap();
    for (i, v) in streamed.iter().enumerate() {
        assert_eq!(list.get(i as i64).await.unwrap(), *v);
    }
    let counts: u64 = list.files().readers().len() as u64;
    assert_eq!(list.files().total(), 100);
    assert_eq!(counts, list.num_data_files() as u64);
}

#[tokio::test]
async fn concurrent_writers_preserve_their_own_order() {
    let root = scratch("multi-writer");
    {
        let _list: ShardList<i64> = ShardList::new(Some(root.clone()), options(2))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..10i64 {
        let root = root.clone();
        handles.push(tokio::spawn(async move {
            let mut list: ShardList<i64> = ShardList::open(root).await.unwrap();
            for j in 0..i {
                list.append(100 * i + j).await.unwrap();
            }
            list.flush().await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let reader: ShardList<i64> = ShardList::open(root).await.unwrap();
    assert_eq!(reader.len(), 45);

    let elements: Vec<i64> = reader.stream().try_collect().await.unwrap();
    let mut sorted = elements.clone();
    sorted.sort();
    let mut expected = Vec::new();
    for i in 0..10i64 {
        for j in 0..i {
            expected.push(100 * i + j);
        }
    }
    assert_eq!(sorted, expected);

    // No cross-writer order is promised, but each writer's own elements
    // appear in its append order.
    for i in 0..10i64 {
        let own: Vec<i64> = elements
            .iter()
            .copied()
            .filter(|v| *v / 100 == i)
            .collect();
        let mut own_sorted = own.clone();
        own_sorted.sort();
        assert_eq!(own, own_sorted, "writer {i} order was not preserved");
    }
}

#[tokio::test]
async fn orphan_data_files_are_invisible() {
    let root = scratch("orphans");
    let mut list: ShardList<i64> = ShardList::new(Some(root.clone()), options(10))
        .await
        .unwrap();
    list.extend(0..25).await.unwrap();
    list.flush().await.unwrap();
    assert_eq!(list.len(), 25);

    // A writer that crashed between the data-file write and the manifest
    // merge leaves a well-formed file that no manifest mentions.
    let format = list.storage_format();
    let orphan_rows: Vec<i64> = (1000..1010).collect();
    list.data_path()
        .joinpath("99999999999999.000000_dead-writer_10.pickle_zstd")
        .write_bytes(format.encode_batch(&orphan_rows).unwrap(), false)
        .await
        .unwrap();

    let reader: ShardList<i64> = ShardList::open(root).await.unwrap();
    assert_eq!(reader.len(), 25);
    let elements: Vec<i64> = reader.stream().try_collect().await.unwrap();
    assert!(elements.iter().all(|v| *v < 1000));

    let orphans = reader.orphans().await.unwrap();
    assert_eq!(orphans.len(), 1);

    // Later writes still work and do not adopt the orphan.
    let mut writer: ShardList<i64> = ShardList::open(reader.path().clone()).await.unwrap();
    writer.append(25).await.unwrap();
    writer.flush().await.unwrap();
    assert_eq!(writer.len(), 26);
    assert_eq!(writer.orphans().await.unwrap().len(), 1);
}

#[tokio::test]
async fn eager_flush_defers_manifest_update() {
    let root = scratch("eager");
    let mut writer: ShardList<i64> = ShardList::new(Some(root.clone()), options(10))
        .await
        .unwrap();
    writer.extend(0..12).await.unwrap();
    writer.flush_eager().await.unwrap();

    // The writer's own view includes the eager entries...
    assert_eq!(writer.len(), 12);
    // ...but the manifest has not been touched, so a fresh reader sees
    // nothing yet.
    let reader: ShardList<i64> = ShardList::open(root.clone()).await.unwrap();
    assert_eq!(reader.len(), 0);

    // Any handle's plain flush integrates all interim files.
    let mut other: ShardList<i64> = ShardList::open(root.clone()).await.unwrap();
    other.flush().await.unwrap();
    assert_eq!(other.len(), 12);

    let reader: ShardList<i64> = ShardList::open(root).await.unwrap();
    let elements: Vec<i64> = reader.stream().try_collect().await.unwrap();
    assert_eq!(elements, (0..12).collect::<Vec<_>>());
}

#[tokio::test]
async fn reload_is_monotonic_across_other_writers() {
    let root = scratch("reload");
    let mut writer1: ShardList<i64> = ShardList::new(Some(root.clone()), options(5))
        .await
        .unwrap();
    writer1.extend(0..5).await.unwrap();
    writer1.flush().await.unwrap();

    let mut observer: ShardList<i64> = ShardList::open(root.clone()).await.unwrap();
    let mut last_len = observer.len();
    assert_eq!(last_len, 5);

    for round in 1..4i64 {
        let mut writer2: ShardList<i64> = ShardList::open(root.clone()).await.unwrap();
        writer2.extend(round * 10..round * 10 + 5).await.unwrap();
        writer2.flush().await.unwrap();

        observer.reload().await.unwrap();
        assert!(observer.len() >= last_len, "len shrank across reload");
        last_len = observer.len();
    }
    assert_eq!(last_len, 20);
}

#[tokio::test]
async fn shipped_file_handles_read_independently() {
    let root = scratch("shipping");
    let mut list: ShardList<i64> = ShardList::new(Some(root), options(4)).await.unwrap();
    list.extend(0..10).await.unwrap();
    list.flush().await.unwrap();

    // Ship only the small specs, as a worker process would receive them.
    let specs: Vec<_> = list.files().readers().iter().map(|r| r.spec()).collect();
    let mut total = 0u64;
    let mut sum = 0i64;
    for spec in &specs {
        let reader: shardlist_store::FileReader<i64> =
            shardlist_store::FileReader::from_spec(spec).unwrap();
        total += reader.len().await.unwrap();
        sum += reader.load().await.unwrap().iter().sum::<i64>();
    }
    assert_eq!(total, 10);
    assert_eq!(sum, 45);
}

#[tokio::test]
async fn destroy_removes_everything() {
    let root = scratch("destroy");
    let mut list: ShardList<i64> = ShardList::new(Some(root.clone()), options(3))
        .await
        .unwrap();
    list.extend(0..9).await.unwrap();
    list.flush().await.unwrap();
    assert!(root.is_dir().await.unwrap());

    list.destroy().await.unwrap();
    assert!(!root.exists().await.unwrap());
}

#[tokio::test]
async fn local_filesystem_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let root = UPath::local(dir.path().join("store")).unwrap();

    let mut list: ShardList<String> = ShardList::new(Some(root.clone()), options(8))
        .await
        .unwrap();
    list.extend((0..20).map(|i| format!("row-{i:02}")))
        .await
        .unwrap();
    list.flush().await.unwrap();

    let reader: ShardList<String> = ShardList::open(root).await.unwrap();
    assert_eq!(reader.len(), 20);
    assert_eq!(reader.get(0).await.unwrap(), "row-00");
    assert_eq!(reader.get(-1).await.unwrap(), "row-19");
    let all: Vec<String> = reader.stream().try_collect().await.unwrap();
    assert_eq!(all.len(), 20);
    assert_eq!(all[7], "row-07");
}
