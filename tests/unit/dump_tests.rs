use std::io::Write;

use worker_supervisor::diagnostics::{write_dump, Buffering, DumpOutput, DumpRequest};
use worker_supervisor::AppError;

fn hello(out: &mut dyn Write) -> std::io::Result<()> {
    out.write_all(b"hello dump\n")
}

#[test]
fn writes_to_requested_path() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("out.txt");

    let output = write_dump(&DumpRequest::to_path(&path), Buffering::Unsupported, hello).expect("dump");
    assert_eq!(
        output,
        DumpOutput {
            path: Some(path.clone()),
            data: None
        }
    );
    assert_eq!(std::fs::read_to_string(&path).expect("read"), "hello dump\n");
}

#[test]
fn returns_buffered_data_without_path() {
    let output = write_dump(&DumpRequest::default(), Buffering::Allowed, hello).expect("dump");
    assert_eq!(output.data.as_deref(), Some("hello dump\n"));
    assert_eq!(output.path, None);
}

#[test]
fn logs_buffered_data_with_tag() {
    let output = write_dump(&DumpRequest::to_log("threads"), Buffering::Allowed, hello).expect("dump");
    assert_eq!(output, DumpOutput::default());
}

#[test]
fn unbuffered_dump_requires_path() {
    let err = write_dump(&DumpRequest::default(), Buffering::Unsupported, hello).expect_err("needs path");
    assert!(matches!(err, AppError::InvalidArgument(_)));

    let err = write_dump(&DumpRequest::to_log("heap"), Buffering::Unsupported, hello).expect_err("needs path");
    assert!(matches!(err, AppError::InvalidArgument(_)));
}

#[test]
fn unwritable_path_is_io_error() {
    let request = DumpRequest::to_path("/definitely/not/here/out.txt");
    let err = write_dump(&request, Buffering::Allowed, hello).expect_err("cannot create");
    assert!(matches!(err, AppError::Io(ref msg) if msg.contains("/definitely/not/here")));
}

#[test]
fn output_omits_absent_fields_on_the_wire() {
    let json = serde_json::to_value(DumpOutput::default()).expect("serialize");
    assert_eq!(json, serde_json::json!({}));
}
