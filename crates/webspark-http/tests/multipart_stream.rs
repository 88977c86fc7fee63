//! Streaming behavior of the multipart parser: chunked consumption, memory
//! bounds, and duplicate-name promotion over realistic bodies.

use std::io::Cursor;

use proptest::prelude::*;
use webspark_http::{MultiValue, MultipartConfig, MultipartParser};

fn content_type(boundary: &str) -> String {
    format!("multipart/form-data; boundary={boundary}")
}

fn field_part(boundary: &str, name: &str, value: &str) -> Vec<u8> {
    format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
    )
    .into_bytes()
}

fn file_part(boundary: &str, name: &str, filename: &str, ctype: &str, payload: &[u8]) -> Vec<u8> {
    let mut part = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: {ctype}\r\n\r\n"
    )
    .into_bytes();
    part.extend_from_slice(payload);
    part.extend_from_slice(b"\r\n");
    part
}

fn closing(boundary: &str) -> Vec<u8> {
    format!("--{boundary}--\r\n").into_bytes()
}

fn parser_for(body: Vec<u8>, boundary: &str, config: MultipartConfig) -> MultipartParser<Cursor<Vec<u8>>> {
    let len = body.len();
    MultipartParser::new(Cursor::new(body), content_type(boundary), len, config)
        .expect("parser construction")
}

#[test]
fn round_trip_single_field() {
    let boundary = "----WebSparkBoundary";
    let mut body = field_part(boundary, "name", "value");
    body.extend_from_slice(&closing(boundary));

    let mut parser = parser_for(body, boundary, MultipartConfig::default());
    let (forms, files) = parser.parse().expect("multipart parse");

    assert_eq!(forms.len(), 1);
    assert_eq!(forms["name"], MultiValue::Single("value".to_string()));
    assert!(files.is_empty());
}

#[test]
fn file_part_round_trips_metadata_and_content() {
    let boundary = "----WebSparkBoundary";
    let mut body = file_part(boundary, "file", "test.txt", "text/plain", b"test file content");
    body.extend_from_slice(&closing(boundary));

    let mut parser = parser_for(body, boundary, MultipartConfig::default());
    parser.parse().expect("multipart parse");

    let mut files = parser.take_files();
    let MultiValue::Single(upload) = files.get_mut("file").expect("file entry") else {
        panic!("expected single upload");
    };
    assert_eq!(upload.filename, "test.txt");
    assert_eq!(upload.content_type, "text/plain");
    assert_eq!(
        upload.read_bytes().expect("read upload"),
        b"test file content".to_vec()
    );
}

#[test]
fn duplicate_file_names_promote_in_upload_order() {
    let boundary = "----WebSparkBoundary";
    let mut body = file_part(boundary, "files", "test1.txt", "text/plain", b"file1 content");
    body.extend_from_slice(&file_part(
        boundary,
        "files",
        "test2.txt",
        "text/plain",
        b"file2 content",
    ));
    body.extend_from_slice(&closing(boundary));

    let mut parser = parser_for(body, boundary, MultipartConfig::default());
    parser.parse().expect("multipart parse");

    let files = parser.take_files();
    let MultiValue::Many(uploads) = &files["files"] else {
        panic!("expected promoted list");
    };
    assert_eq!(uploads.len(), 2);
    assert_eq!(uploads[0].filename, "test1.txt");
    assert_eq!(uploads[1].filename, "test2.txt");
}

#[test]
fn large_file_stays_within_the_scan_window() {
    let boundary = "----WebSparkBoundary";
    let chunk_size = 1024;
    let payload = vec![b'x'; 256 * 1024];

    let mut body = file_part(boundary, "file", "large.bin", "application/octet-stream", &payload);
    body.extend_from_slice(&closing(boundary));

    let config = MultipartConfig::new().chunk_size(chunk_size);
    let mut parser = parser_for(body, boundary, config);
    parser.parse().expect("multipart parse");

    // The retained window is chunk_size plus the boundary tail; the payload
    // itself must never accumulate in memory.
    let blength = boundary.len() + 2;
    assert!(
        parser.peak_buffer_len() <= chunk_size + blength + 2,
        "scan buffer grew to {} bytes",
        parser.peak_buffer_len()
    );

    let mut files = parser.take_files();
    let MultiValue::Single(upload) = files.get_mut("file").expect("file entry") else {
        panic!("expected single upload");
    };
    assert_eq!(upload.read_bytes().expect("read upload"), payload);
}

#[test]
fn every_chunk_alignment_parses_the_same_body() {
    // Small chunk sizes walk the closing marker and boundary across every
    // possible read split.
    let boundary = "ab1";
    let mut body = field_part(boundary, "alpha", "first value");
    body.extend_from_slice(&file_part(boundary, "blob", "b.bin", "application/octet-stream", b"0123456789"));
    body.extend_from_slice(&field_part(boundary, "alpha", "second value"));
    body.extend_from_slice(&closing(boundary));

    for chunk_size in 7..=24 {
        let config = MultipartConfig::new().chunk_size(chunk_size);
        let mut parser = parser_for(body.clone(), boundary, config);
        let err = parser.parse().err();
        assert!(err.is_none(), "chunk_size {chunk_size}: {err:?}");

        let forms = parser.take_forms();
        assert_eq!(
            forms["alpha"],
            MultiValue::Many(vec!["first value".to_string(), "second value".to_string()]),
            "chunk_size {chunk_size}"
        );

        let mut files = parser.take_files();
        let MultiValue::Single(upload) = files.get_mut("blob").expect("file entry") else {
            panic!("expected single upload");
        };
        assert_eq!(upload.read_bytes().expect("read upload"), b"0123456789".to_vec());
    }
}

#[test]
fn lf_delimited_stream_parses_like_crlf() {
    let boundary = "----WebSparkBoundary";
    let body = format!(
        "--{boundary}\nContent-Disposition: form-data; name=\"field1\"\n\nvalue1\n--{boundary}--\n"
    )
    .into_bytes();

    let mut parser = parser_for(body, boundary, MultipartConfig::default());
    let (forms, files) = parser.parse().expect("multipart parse");
    assert_eq!(forms["field1"], MultiValue::Single("value1".to_string()));
    assert!(files.is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The sliding-window invariant: for any payload, boundary length, and
    /// chunk size, the scanner reconstructs the payload exactly and never
    /// retains more than the window plus a small header allowance.
    #[test]
    fn prop_sliding_window_preserves_payload(
        payload in prop::collection::vec(any::<u8>(), 0..4096),
        boundary in "[A-Za-z0-9]{8,40}",
        chunk_size in 64usize..512,
    ) {
        let needle = format!("--{boundary}").into_bytes();
        prop_assume!(memchr::memmem::find(&payload, &needle).is_none());

        let mut body = file_part(&boundary, "data", "blob.bin", "application/octet-stream", &payload);
        body.extend_from_slice(&field_part(&boundary, "note", "value-1"));
        body.extend_from_slice(&closing(&boundary));

        let config = MultipartConfig::new().chunk_size(chunk_size);
        let mut parser = parser_for(body, &boundary, config);
        parser.parse().expect("multipart parse");

        let blength = needle.len();
        prop_assert!(parser.peak_buffer_len() <= chunk_size + blength + 2 + 256);

        let forms = parser.take_forms();
        prop_assert_eq!(&forms["note"], &MultiValue::Single("value-1".to_string()));

        let mut files = parser.take_files();
        let MultiValue::Single(upload) = files.get_mut("data").expect("file entry") else {
            panic!("expected single upload");
        };
        prop_assert_eq!(upload.read_bytes().expect("read upload"), payload);
    }
}
