// Copyright 2024 Compile Proxy Authors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Bridges a byte stream (socketpair to the daemon) onto a controller: request frames in,
//! notification frames out. The connection ends with a CLOSED frame once the controller has
//! drained its children.

use log::warn;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::framing::{
    decode_payload, read_frame, write_frame, OP_CLOSED, OP_KILL, OP_REGISTER, OP_REQUEST_RUN,
    OP_SET_OPTION, OP_SHUTDOWN, OP_STARTED, OP_TERMINATED,
};
use crate::server::start_controller;
use crate::types::{
    ControllerOptions, SubProcessEvent, SubProcessId, SubProcessOp, SubProcessReq,
    SubProcessSetOption,
};

fn decode_request(op: u32, payload: &[u8]) -> Result<SubProcessOp, String> {
    match op {
        OP_REGISTER => Ok(SubProcessOp::Register(decode_payload::<SubProcessReq>(
            op, payload,
        )?)),
        OP_REQUEST_RUN => Ok(SubProcessOp::RequestRun(decode_payload::<SubProcessId>(
            op, payload,
        )?)),
        OP_KILL => Ok(SubProcessOp::Kill(decode_payload::<SubProcessId>(
            op, payload,
        )?)),
        OP_SET_OPTION => Ok(SubProcessOp::SetOption(decode_payload::<
            SubProcessSetOption,
        >(op, payload)?)),
        OP_SHUTDOWN => Ok(SubProcessOp::Shutdown),
        other => Err(format!("unknown request op {other}")),
    }
}

async fn write_event<W>(writer: &mut W, event: &SubProcessEvent) -> Result<(), String>
where
    W: AsyncWrite + Unpin,
{
    match event {
        SubProcessEvent::Started(started) => write_frame(writer, OP_STARTED, started).await,
        SubProcessEvent::Terminated(terminated) => {
            write_frame(writer, OP_TERMINATED, terminated).await
        }
        SubProcessEvent::Closed => write_frame(writer, OP_CLOSED, &()).await,
    }
}

///
/// Serves one connection until the peer shuts down (SHUTDOWN frame or EOF). Consumes the
/// stream; the final frame written is CLOSED.
///
/// Reading and writing run as independent halves so a notification burst can never interrupt a
/// partially read request frame.
///
pub async fn serve_stream<S>(stream: S, options: ControllerOptions) -> Result<(), String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (controller, mut events) = start_controller(options);
    let (mut reader, mut writer) = tokio::io::split(stream);

    let read_half = async {
        loop {
            match read_frame(&mut reader).await? {
                None => {
                    controller.shutdown();
                    return Ok::<(), String>(());
                }
                Some((op, payload)) => match decode_request(op, &payload) {
                    Ok(request) => {
                        let is_shutdown = matches!(request, SubProcessOp::Shutdown);
                        controller.send_op(request);
                        if is_shutdown {
                            return Ok(());
                        }
                    }
                    Err(err) => {
                        warn!("dropping malformed frame: {err}");
                    }
                },
            }
        }
    };

    // Forwards notifications until the controller reports itself drained.
    let write_half = async {
        while let Some(event) = events.recv().await {
            let done = matches!(event, SubProcessEvent::Closed);
            write_event(&mut writer, &event).await?;
            if done {
                break;
            }
        }
        Ok(())
    };

    let ((), ()) = tokio::try_join!(read_half, write_half)?;
    Ok(())
}
