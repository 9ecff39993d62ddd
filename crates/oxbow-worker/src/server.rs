//! The worker's listener and frame dispatch loop.

use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use oxbow_protocol::{Frame, ProtocolError, read_frame, write_frame};

use crate::interpreter::Interpreter;

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum WorkerError {
    #[error("failed to bind the rendezvous listener")]
    Bind(#[source] std::io::Error),

    #[error("failed to accept the host connection")]
    Accept(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The stdout handshake line the host waits for before connecting.
pub fn port_announcement(port: u16) -> String {
    format!("Listening port {port}")
}

/// The stdout handshake line announcing the interpreter's debugger port.
pub fn debug_port_announcement(port: u16) -> String {
    format!("Listening debug port {port}")
}

/// Binds the listener, performs the stdout handshake and serves exactly one
/// host connection.
pub async fn run(
    mut interpreter: Box<dyn Interpreter>,
    debug: bool,
) -> Result<(), WorkerError> {
    if debug {
        match interpreter.start_debugger().await {
            Ok(port) => announce(&debug_port_announcement(port))?,
            Err(err) => tracing::error!("could not open the debug port: {}", err.exception),
        }
    }

    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(WorkerError::Bind)?;
    let port = listener.local_addr().map_err(WorkerError::Bind)?.port();
    announce(&port_announcement(port))?;

    let (stream, peer) = listener.accept().await.map_err(WorkerError::Accept)?;
    tracing::debug!("connection accepted from {peer}");
    serve_connection(stream, interpreter).await;
    Ok(())
}

fn announce(line: &str) -> Result<(), WorkerError> {
    let mut stdout = std::io::stdout();
    writeln!(stdout, "{line}")?;
    stdout.flush()?;
    Ok(())
}

/// Serves frames on an established connection until the host sends `exit`
/// or goes away.
///
/// Requests are dispatched as tasks; replies are serialized by the write
/// lock so concurrent executions cannot interleave frames.
pub async fn serve_connection<S>(stream: S, interpreter: Box<dyn Interpreter>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let writer = Arc::new(Mutex::new(writer));
    let interpreter = Arc::new(Mutex::new(interpreter));

    loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Execute {
                module_path,
                function,
                args,
                kwargs,
            })) => {
                tracing::info!("execute {module_path}.{function}");
                let writer = writer.clone();
                let interpreter = interpreter.clone();
                tokio::spawn(async move {
                    let reply = match interpreter
                        .lock()
                        .await
                        .execute(&module_path, &function, args, kwargs)
                        .await
                    {
                        Ok(result) => Frame::ExecutionFinished {
                            result,
                            message: Some("process execution done".to_string()),
                        },
                        Err(err) => err.into_frame(),
                    };
                    send(&writer, &reply).await;
                });
            }
            Ok(Some(Frame::Run {
                script_path,
                args,
                run_name,
            })) => {
                tracing::info!("run {script_path}");
                let writer = writer.clone();
                let interpreter = interpreter.clone();
                tokio::spawn(async move {
                    let reply = match interpreter
                        .lock()
                        .await
                        .run_script(&script_path, args, &run_name)
                        .await
                    {
                        Ok(result) => Frame::ExecutionFinished {
                            result,
                            message: Some("script run done".to_string()),
                        },
                        Err(err) => err.into_frame(),
                    };
                    send(&writer, &reply).await;
                });
            }
            Ok(Some(Frame::Exit)) => {
                tracing::info!("exit");
                send(&writer, &Frame::Exited).await;
                break;
            }
            Ok(Some(other)) => {
                tracing::warn!("got an unexpected message: {other:?}");
            }
            Ok(None) => {
                tracing::info!("the host closed the connection");
                break;
            }
            Err(err) => {
                report_read_error(&writer, &err).await;
                break;
            }
        }
    }

    interpreter.lock().await.shutdown().await;
}

async fn send<W>(writer: &Arc<Mutex<WriteHalf<W>>>, frame: &Frame)
where
    W: AsyncWrite + Send + 'static,
{
    let mut writer = writer.lock().await;
    if let Err(err) = write_frame(&mut *writer, frame).await {
        tracing::error!("failed to send a frame: {err}");
    }
}

/// An undecodable request is reported back as an error frame before the
/// worker gives up on the stream.
async fn report_read_error<W>(writer: &Arc<Mutex<WriteHalf<W>>>, err: &ProtocolError)
where
    W: AsyncWrite + Send + 'static,
{
    tracing::error!("failed to read a frame: {err}");
    let reply = Frame::Error {
        exception: err.to_string(),
        traceback: Vec::new(),
    };
    send(writer, &reply).await;
}
