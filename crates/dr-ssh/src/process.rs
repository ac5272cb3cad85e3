//! Exec channel driver

use std::sync::Arc;

use bytes::Bytes;
use russh::client::Handle;
use russh::ChannelMsg;

use dr_core::{RemoteExit, RemoteProcess, RemoteProcessSink};

use crate::connection::ClientHandler;

/// SSH extended data type for stderr
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Run `command` in a new exec channel on `handle`
pub(crate) fn spawn(handle: Arc<Handle<ClientHandler>>, command: String) -> RemoteProcess {
    if handle.is_closed() {
        tracing::warn!("Not running '{}': session is closed", command);
        return RemoteProcess::failed("Session is closed");
    }
    let (sink, process) = RemoteProcess::channel();
    tokio::spawn(async move {
        let exit = drive(&handle, &command, &sink).await;
        tracing::debug!("Remote command finished: {:?}", exit);
        sink.closed(exit).await;
    });
    process
}

async fn drive(
    handle: &Handle<ClientHandler>,
    command: &str,
    sink: &RemoteProcessSink,
) -> RemoteExit {
    let mut channel = match handle.channel_open_session().await {
        Ok(channel) => channel,
        Err(e) => return RemoteExit::failed_to_start(format!("Failed to open channel: {}", e)),
    };

    tracing::debug!("Executing remote command: {}", command);
    if let Err(e) = channel.exec(true, command).await {
        return RemoteExit::failed_to_start(format!("Failed to execute command: {}", e));
    }

    let mut started = false;
    let mut exit_code: Option<i32> = None;
    let mut signal: Option<String> = None;

    loop {
        tokio::select! {
            _ = sink.close_requested() => {
                let _ = channel.close().await;
                return RemoteExit::killed("Channel closed");
            }
            msg = channel.wait() => {
                let Some(msg) = msg else { break };
                match msg {
                    ChannelMsg::Success => mark_started(&mut started, sink).await,
                    ChannelMsg::Failure => {
                        if !started {
                            let _ = channel.close().await;
                            return RemoteExit::failed_to_start("Server refused to execute the command");
                        }
                    }
                    ChannelMsg::Data { data } => {
                        mark_started(&mut started, sink).await;
                        sink.output(Bytes::copy_from_slice(&data[..])).await;
                    }
                    ChannelMsg::ExtendedData { data, ext } => {
                        if ext == SSH_EXTENDED_DATA_STDERR {
                            mark_started(&mut started, sink).await;
                            sink.error_output(Bytes::copy_from_slice(&data[..])).await;
                        }
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        exit_code = Some(exit_status as i32);
                    }
                    ChannelMsg::ExitSignal {
                        signal_name,
                        error_message,
                        ..
                    } => {
                        signal = Some(if error_message.is_empty() {
                            format!("Process killed by signal {:?}", signal_name)
                        } else {
                            format!("Process killed by signal {:?}: {}", signal_name, error_message)
                        });
                    }
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }
        }
    }

    classify(exit_code, signal, started)
}

/// Exit report for a channel that closed on its own.
///
/// A signal wins over an exit status; a channel that closed with neither
/// failed to start unless the command had already started.
fn classify(exit_code: Option<i32>, signal: Option<String>, started: bool) -> RemoteExit {
    match (exit_code, signal) {
        (_, Some(signal)) => RemoteExit::killed(signal),
        (Some(code), None) => RemoteExit::exited(code),
        (None, None) if !started => {
            RemoteExit::failed_to_start("Channel closed before the command started")
        }
        (None, None) => RemoteExit::killed("Channel closed without an exit status"),
    }
}

/// Report `Started` once, on the exec reply or the first output
async fn mark_started(started: &mut bool, sink: &RemoteProcessSink) {
    if !*started {
        *started = true;
        sink.started().await;
    }
}
