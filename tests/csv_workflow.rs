// tests/csv_workflow.rs
//
// CSV preview -> import -> query, through the command surface.

use std::io::Write;
use std::sync::Arc;

use wiretap_buffers::buffers;
use wiretap_buffers::io::{CsvColumnRole, CsvImportOptions, TimestampUnit};
use wiretap_buffers::{BufferKind, BufferRegistry, StoreSettings};

fn csv_file(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

/// SavvyCAN-style export: 40 good rows over two ids, then one bad id
fn savvycan_export() -> String {
    let mut csv = String::from("Time Stamp,ID,Extended,Dir,Bus,LEN,D1,D2\n");
    for i in 0..40u64 {
        let id = if i % 3 == 0 { "00000100" } else { "00000200" };
        csv.push_str(&format!("{},{},false,Rx,0,2,{:02X},{:02X}\n", 1_000 + i * 250, id, i, i + 1));
    }
    csv.push_str("11000,zzzz,false,Rx,0,2,00,00\n");
    csv
}

#[tokio::test]
async fn test_import_count_matches_parsable_rows() {
    let file = csv_file(&savvycan_export());
    let path = file.path().to_string_lossy().into_owned();
    let registry = Arc::new(BufferRegistry::in_memory().unwrap());
    let settings = StoreSettings::default();

    let preview = buffers::preview_csv(&settings, path.clone(), Some(5)).await.unwrap();
    assert!(preview.has_header);
    assert_eq!(preview.rows.len(), 5);
    assert_eq!(preview.total_rows, 41);
    assert_eq!(preview.suggested_mappings[1].role, CsvColumnRole::FrameId);

    let options = CsvImportOptions::from_preview(&preview);
    let summary = buffers::import_csv_with_mapping(
        &registry,
        path,
        options.mappings,
        options.skip_first_row,
        options.timestamp_unit,
        options.negate_timestamps,
    )
    .await
    .unwrap();

    // 41 data rows, one unparsable id
    assert_eq!(summary.metadata.count, 40);
    assert_eq!(summary.skipped_rows, 1);
    assert_eq!(summary.metadata.kind, BufferKind::Frames);
}

#[tokio::test]
async fn test_filtered_views_keep_original_positions() {
    let file = csv_file(&savvycan_export());
    let registry = Arc::new(BufferRegistry::in_memory().unwrap());
    let options = CsvImportOptions {
        timestamp_unit: TimestampUnit::Microseconds,
        ..CsvImportOptions::from_preview(
            &buffers::preview_csv(&StoreSettings::default(), file.path().to_string_lossy().into_owned(), None)
                .await
                .unwrap(),
        )
    };
    let summary = buffers::spawn_csv_import(Arc::clone(&registry), file.path().to_path_buf(), options)
        .join()
        .await
        .unwrap();
    let id = summary.metadata.id;
    buffers::set_active_buffer(&registry, id.clone()).await.unwrap();

    // Rows 1, 4, 7, ... carry id 0x100
    let page = buffers::get_buffer_frames_paginated_filtered(&registry, 2, 3, vec![0x100])
        .await
        .unwrap();
    assert_eq!(page.total_count, 14);
    assert_eq!(page.original_indices, vec![7, 10, 13]);
    assert!(page.frames.iter().all(|f| f.frame_id == 0x100));

    let tail = buffers::get_buffer_frames_tail(&registry, 2, vec![0x100]).await.unwrap();
    assert_eq!(tail.original_indices, vec![37, 40]);
    assert_eq!(tail.total_filtered_count, 14);

    // Frame at position 7 has timestamp 1000 + 6 * 250
    let offset = buffers::find_buffer_offset_for_timestamp(&registry, Some(id.clone()), 2_500, vec![0x100])
        .await
        .unwrap();
    assert_eq!(offset, 2);
    let offset = buffers::find_buffer_offset_for_timestamp(&registry, Some(id.clone()), 1_000_000, vec![0x100])
        .await
        .unwrap();
    assert_eq!(offset, 14);

    let info = buffers::get_buffer_frame_info(&registry).await.unwrap();
    let ids: Vec<u32> = info.iter().map(|i| i.frame_id).collect();
    assert_eq!(ids, vec![0x100, 0x200]);
    assert_eq!(info[0].count, 14);
}

#[tokio::test]
async fn test_broken_row_aborts_with_line_number() {
    let file = csv_file("id,time,data\n0x1,1,00\n0x2,2,00,extra\n");
    let registry = Arc::new(BufferRegistry::in_memory().unwrap());
    let options = CsvImportOptions {
        mappings: vec![],
        skip_first_row: true,
        ..CsvImportOptions::default()
    };

    let err = buffers::import_csv_with_mapping(
        &registry,
        file.path().to_string_lossy().into_owned(),
        options.mappings,
        options.skip_first_row,
        options.timestamp_unit,
        options.negate_timestamps,
    )
    .await
    .unwrap_err();
    assert!(err.contains(":3:"), "unexpected error: {}", err);
    assert!(registry.list().unwrap().is_empty());
}
