//! The columnar view over pre-existing Parquet files: discovery order,
//! row-group granularity, column projection, and the single-column
//! scalar row shape.

use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use futures::TryStreamExt;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde_json::Value;
use shardlist_path::UPath;
use shardlist_serial::StorageFormat;
use shardlist_store::ExternalShardList;
use uuid::Uuid;

fn scratch(name: &str) -> UPath {
    UPath::memory(&format!("external-tests/{name}/{}", Uuid::new_v4()))
}

/// A Parquet file of `n` rows with row groups of at most 10 rows:
/// columns `make` (constant), `year` (1990 + i), `sales` (base + i).
fn car_parquet(make: &str, n: usize, sales_base: i64) -> Vec<u8> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("make", DataType::Utf8, false),
        Field::new("year", DataType::Int64, false),
        Field::new("sales", DataType::Int64, false),
    ]));
    let makes: ArrayRef = Arc::new(StringArray::from(vec![make; n]));
    let years: ArrayRef = Arc::new(Int64Array::from(
        (0..n).map(|i| 1990 + i as i64).collect::<Vec<_>>(),
    ));
    let sales: ArrayRef = Arc::new(Int64Array::from(
        (0..n).map(|i| sales_base + i as i64).collect::<Vec<_>>(),
    ));
    let batch = RecordBatch::try_new(schema.clone(), vec![makes, years, sales]).unwrap();

    let props = WriterProperties::builder()
        .set_max_row_group_size(10)
        .build();
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, schema, Some(props)).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
    buf
}

async fn car_lot(root: &UPath) {
    root.joinpath("ford.parquet")
        .write_bytes(car_parquet("ford", 61, 234), false)
        .await
        .unwrap();
    root.joinpath("honda.parquet")
        .write_bytes(car_parquet("honda", 51, 500), false)
        .await
        .unwrap();
}

#[tokio::test]
async fn discovers_files_in_lexicographic_order() {
    let data = scratch("discovery/data");
    car_lot(&data).await;

    let view = ExternalShardList::new(
        vec![data],
        Some(scratch("discovery/meta")),
        StorageFormat::parse("parquet").unwrap(),
        None,
    )
    .await
    .unwrap();

    assert_eq!(view.num_data_files(), 2);
    assert_eq!(view.len().unwrap(), 112);

    let files = view.files().unwrap();
    assert_eq!(files.reader(0).unwrap().num_row_groups().await.unwrap(), 7);
    assert_eq!(files.reader(1).unwrap().num_row_groups().await.unwrap(), 6);

    // Rows stream ford first, then honda: lexicographic path order.
    let rows: Vec<Value> = view.stream().unwrap().try_collect().await.unwrap();
    assert_eq!(rows.len(), 112);
    assert_eq!(rows[0]["make"], "ford");
    assert_eq!(rows[60]["make"], "ford");
    assert_eq!(rows[61]["make"], "honda");
    assert_eq!(rows[111]["make"], "honda");
}

#[tokio::test]
async fn indexed_access_decodes_one_row_group() {
    let data = scratch("row-groups/data");
    car_lot(&data).await;

    let view = ExternalShardList::new(
        vec![data],
        None,
        StorageFormat::parse("parquet").unwrap(),
        None,
    )
    .await
    .unwrap();

    // Row 5 of ford.
    let row = view.get(5).await.unwrap();
    assert_eq!(row["make"], "ford");
    assert_eq!(row["year"], 1995);
    // Row 3 of honda (61 + 3).
    let row = view.get(64).await.unwrap();
    assert_eq!(row["make"], "honda");
    assert_eq!(row["sales"], 503);
    // Negative indexing from the end.
    let row = view.get(-1).await.unwrap();
    assert_eq!(row["make"], "honda");
    assert_eq!(row["year"], 1990 + 50);

    // One row group decodes exactly its own rows.
    let files = view.files().unwrap();
    let group = files.reader(0).unwrap().row_group(6).await.unwrap();
    assert_eq!(group.len(), 1);
    let group = files.reader(1).unwrap().row_group(0).await.unwrap();
    assert_eq!(group.len(), 10);
    assert_eq!(group.row(0).unwrap()["sales"], 500);
}

#[tokio::test]
async fn single_column_projection_yields_bare_scalars() {
    let data = scratch("projection/data");
    car_lot(&data).await;

    let view = ExternalShardList::new(
        vec![data],
        None,
        StorageFormat::parse("parquet").unwrap(),
        None,
    )
    .await
    .unwrap();
    let files = view.files().unwrap();
    let ford = files.reader(0).unwrap();

    let sales = ford.columns(&["sales"]).await.unwrap();
    assert_eq!(sales.get_row(3).await.unwrap(), Value::from(237));

    // Two columns keep the map shape.
    let pair = ford.columns(&["make", "sales"]).await.unwrap();
    let row = pair.get_row(3).await.unwrap();
    assert_eq!(row["make"], "ford");
    assert_eq!(row["sales"], 237);

    // Projections narrow; they never widen.
    assert!(pair.columns(&["year"]).await.is_err());
    assert!(ford.columns(&["no_such_column"]).await.is_err());

    // A whole column as one Arrow array.
    let array = ford.column("sales").await.unwrap();
    assert_eq!(array.len(), 61);
}

#[tokio::test]
async fn batches_stream_with_requested_size() {
    let data = scratch("batches/data");
    car_lot(&data).await;

    let view = ExternalShardList::new(
        vec![data],
        None,
        StorageFormat::parse("parquet").unwrap(),
        None,
    )
    .await
    .unwrap();
    let files = view.files().unwrap();
    let ford = files.reader(0).unwrap();

    let batches: Vec<_> = ford
        .iter_batches(25)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    let total: usize = batches.iter().map(|b| b.len()).sum();
    assert_eq!(total, 61);
    assert!(batches.iter().all(|b| b.len() <= 25));
}

#[tokio::test]
async fn reload_rescans_the_external_root() {
    let data = scratch("rescan/data");
    car_lot(&data).await;

    let mut view = ExternalShardList::new(
        vec![data.clone()],
        Some(scratch("rescan/meta")),
        StorageFormat::parse("parquet").unwrap(),
        None,
    )
    .await
    .unwrap();
    assert_eq!(view.len().unwrap(), 112);

    data.joinpath("acura.parquet")
        .write_bytes(car_parquet("acura", 8, 900), false)
        .await
        .unwrap();
    view.reload().await.unwrap();
    assert_eq!(view.num_data_files(), 3);
    assert_eq!(view.len().unwrap(), 120);

    // "acura.parquet" sorts first, so its rows now lead the sequence.
    let first = view.get(0).await.unwrap();
    assert_eq!(first["make"], "acura");
}

#[tokio::test]
async fn destroying_the_view_leaves_the_data() {
    let data = scratch("destroy/data");
    car_lot(&data).await;

    let meta = scratch("destroy/meta");
    let view = ExternalShardList::new(
        vec![data.clone()],
        Some(meta.clone()),
        StorageFormat::parse("parquet").unwrap(),
        None,
    )
    .await
    .unwrap();
    view.destroy().await.unwrap();

    assert!(!meta.exists().await.unwrap());
    assert!(data.joinpath("ford.parquet").is_file().await.unwrap());
}

#[tokio::test]
async fn persisted_view_reopens_from_its_manifest() {
    let data = scratch("reopen/data");
    car_lot(&data).await;

    let meta = scratch("reopen/meta");
    {
        ExternalShardList::new(
            vec![data],
            Some(meta.clone()),
            StorageFormat::parse("parquet").unwrap(),
            None,
        )
        .await
        .unwrap();
    }
    let view = ExternalShardList::open(meta).await.unwrap();
    assert_eq!(view.len().unwrap(), 112);
    assert!(view.supports_indexing());
    let row = view.get(61).await.unwrap();
    assert_eq!(row["make"], "honda");
}
