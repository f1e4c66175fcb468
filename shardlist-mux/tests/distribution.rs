//! At-most-once distribution across concurrent workers.

use shardlist_mux::Multiplexer;
use shardlist_path::UPath;
use uuid::Uuid;

#[tokio::test]
async fn five_workers_split_twenty_items_exactly_once() {
    let path = UPath::memory(&format!("mux-distribution/{}", Uuid::new_v4()));
    let mux = Multiplexer::new((0..20i64).collect(), path.clone())
        .await
        .unwrap();
    let session = mux.create_read_session().await.unwrap();

    let mut handles = Vec::new();
    for w in 0..5 {
        let path = path.clone();
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            let mut worker: Multiplexer<i64> = Multiplexer::join(path, &session)
                .await
                .unwrap()
                .with_worker_id(format!("worker-{w}"));
            let mut claimed = Vec::new();
            while let Some(item) = worker.next().await.unwrap() {
                claimed.push(item);
                // Give the other workers a chance to interleave.
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut per_worker = Vec::new();
    for h in handles {
        per_worker.push(h.await.unwrap());
    }

    // The union over workers is exactly the dataset, with no duplicates.
    let mut all: Vec<i64> = per_worker.iter().flatten().copied().collect();
    all.sort();
    assert_eq!(all, (0..20).collect::<Vec<_>>());
    assert!(mux.done(&session).await.unwrap());

    // The finish sentinel was written by whoever observed exhaustion.
    assert!(path
        .joinpath("sessions")
        .joinpath(&session)
        .joinpath("finished")
        .is_file()
        .await
        .unwrap());
}

#[tokio::test]
async fn destroy_wipes_dataset_and_sessions() {
    let path = UPath::memory(&format!("mux-distribution/{}", Uuid::new_v4()));
    let mux = Multiplexer::new(vec![1i64, 2, 3], path.clone()).await.unwrap();
    let session = mux.create_read_session().await.unwrap();

    let mut worker: Multiplexer<i64> = Multiplexer::join(path.clone(), &session).await.unwrap();
    assert_eq!(worker.next().await.unwrap(), Some(1));

    worker.destroy().await.unwrap();
    assert!(!path.exists().await.unwrap());
}
