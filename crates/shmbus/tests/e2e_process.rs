//! Two-process end-to-end test over `/dev/shm`.
//!
//! The test re-invokes its own binary with a role environment variable:
//! the reader child creates the region and consumes until close, the
//! writer child opens it and publishes a numbered stream. `Count(1)`
//! paces the writer against the reader, so every version must arrive,
//! in order, across a real process boundary.

use shmbus::{OperationMode, ReaderWaitPolicy, SharedMessage, WriteOutcome};
use std::env;
use std::process::{Command, Stdio};
use std::time::Duration;

const ENV_ROLE: &str = "SHMBUS_E2E_ROLE";
const ENV_NAME: &str = "SHMBUS_E2E_NAME";
const ROLE_WRITER: &str = "writer";
const ROLE_READER: &str = "reader";

const MESSAGE_COUNT: u64 = 1000;

fn run_reader(name: &str) {
    let reader = SharedMessage::create(
        name,
        64,
        OperationMode::ReadSync,
        ReaderWaitPolicy::Count(1),
    )
    .expect("reader: failed to create region");

    let mut expected = 1u64;
    while let Some(payload) = reader.read(true).expect("reader: read failed") {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&payload[..8]);
        let value = u64::from_le_bytes(bytes);
        assert_eq!(value, expected, "reader: stream out of order");
        expected += 1;
    }

    assert_eq!(
        expected - 1,
        MESSAGE_COUNT,
        "reader: stream ended early at {}",
        expected - 1
    );
}

fn run_writer(name: &str) {
    // The reader creates the region; retry until it appears.
    let writer = common::wait_for_resource(
        || SharedMessage::open(name, OperationMode::WriteSync, ReaderWaitPolicy::Count(1)),
        Duration::from_millis(5),
        Duration::from_secs(5),
        "e2e message region",
    )
    .expect("writer: region never appeared");

    for value in 1..=MESSAGE_COUNT {
        let outcome = writer.write(&value.to_le_bytes()).expect("writer: write failed");
        assert_eq!(outcome, WriteOutcome::Committed(value));
    }
    writer.close().expect("writer: close failed");
}

#[test]
fn e2e_two_process_message_stream() {
    if let Ok(role) = env::var(ENV_ROLE) {
        common::setup_logging(common::Environment::from_env());
        let name = env::var(ENV_NAME).expect("role set without a region name");
        match role.as_str() {
            ROLE_READER => run_reader(&name),
            ROLE_WRITER => run_writer(&name),
            other => panic!("unknown role {other}"),
        }
        return;
    }

    let name = format!("/shmbus_e2e_{}", std::process::id());
    let exe = env::current_exe().expect("failed to locate the test binary");

    let mut reader = Command::new(&exe)
        .arg("--exact")
        .arg("e2e_two_process_message_stream")
        .env(ENV_ROLE, ROLE_READER)
        .env(ENV_NAME, &name)
        .stderr(Stdio::inherit())
        .spawn()
        .expect("failed to spawn the reader process");

    let mut writer = Command::new(&exe)
        .arg("--exact")
        .arg("e2e_two_process_message_stream")
        .env(ENV_ROLE, ROLE_WRITER)
        .env(ENV_NAME, &name)
        .stderr(Stdio::inherit())
        .spawn()
        .expect("failed to spawn the writer process");

    let writer_status = writer.wait().expect("failed to wait for the writer");
    let reader_status = reader.wait().expect("failed to wait for the reader");

    let _ = SharedMessage::unlink(&name);

    assert!(writer_status.success(), "writer failed: {writer_status}");
    assert!(reader_status.success(), "reader failed: {reader_status}");
}
