// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use crate::framing::{decode_payload, read_frame, write_frame, OP_REGISTER, OP_TERMINATED};
use crate::types::{Priority, SubProcessReq, SubProcessTerminated, TerminateError, Weight};

fn request(id: u32) -> SubProcessReq {
    SubProcessReq {
        id,
        trace_id: format!("task-{id}"),
        prog: "/usr/bin/cc".into(),
        argv: vec!["cc".to_string(), "-c".to_string(), "foo.c".to_string()],
        envs: vec!["PATH=/usr/bin".to_string()],
        cwd: "/build".into(),
        stdout_file: None,
        stderr_file: None,
        priority: Priority::Low,
        weight: Weight::Light,
        detach: false,
    }
}

#[tokio::test]
async fn frame_round_trip() {
    let mut buffer = Vec::new();
    write_frame(&mut buffer, OP_REGISTER, &request(7)).await.unwrap();

    let mut reader = buffer.as_slice();
    let (op, payload) = read_frame(&mut reader).await.unwrap().unwrap();
    assert_eq!(op, OP_REGISTER);
    let decoded: SubProcessReq = decode_payload(op, &payload).unwrap();
    assert_eq!(decoded.id, 7);
    assert_eq!(decoded.argv[2], "foo.c");
}

#[tokio::test]
async fn consecutive_frames_are_separated() {
    let mut buffer = Vec::new();
    write_frame(&mut buffer, OP_REGISTER, &request(1)).await.unwrap();
    write_frame(
        &mut buffer,
        OP_TERMINATED,
        &SubProcessTerminated {
            id: 1,
            status: Some(0),
            error: None,
        },
    )
    .await
    .unwrap();

    let mut reader = buffer.as_slice();
    let (first_op, _) = read_frame(&mut reader).await.unwrap().unwrap();
    let (second_op, second_payload) = read_frame(&mut reader).await.unwrap().unwrap();
    assert_eq!(first_op, OP_REGISTER);
    assert_eq!(second_op, OP_TERMINATED);
    let terminated: SubProcessTerminated = decode_payload(second_op, &second_payload).unwrap();
    assert_eq!(terminated.status, Some(0));
    assert_eq!(terminated.error, None);
}

#[tokio::test]
async fn clean_eof_is_none() {
    let mut reader: &[u8] = &[];
    assert_eq!(read_frame(&mut reader).await.unwrap(), None);
}

#[tokio::test]
async fn truncated_frame_is_error() {
    let mut buffer = Vec::new();
    write_frame(&mut buffer, OP_REGISTER, &request(1)).await.unwrap();
    buffer.truncate(buffer.len() - 3);

    let mut reader = buffer.as_slice();
    assert!(read_frame(&mut reader).await.is_err());
}

#[tokio::test]
async fn oversized_frame_is_rejected() {
    // Header claiming a payload far beyond the protocol limit.
    let mut buffer = Vec::new();
    buffer.extend_from_slice(&1_u32.to_le_bytes());
    buffer.extend_from_slice(&u32::MAX.to_le_bytes());

    let mut reader = buffer.as_slice();
    assert!(read_frame(&mut reader).await.is_err());
}

#[test]
fn terminate_error_round_trips() {
    let terminated = SubProcessTerminated {
        id: 3,
        status: None,
        error: Some(TerminateError::FailedToSpawn),
    };
    let bytes = bincode::serialize(&terminated).unwrap();
    let decoded: SubProcessTerminated = bincode::deserialize(&bytes).unwrap();
    assert_eq!(decoded, terminated);
}
