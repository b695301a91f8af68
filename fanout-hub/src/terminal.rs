//! Line-oriented terminal client for a running hub.

use anyhow::{Context, Result};
use futures::{Sink, SinkExt, Stream, StreamExt, stream::SplitSink, stream::SplitStream};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::TcpStream,
    select,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use tracing::{info, warn};

use crate::cli::ClientArgs;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketWriter = SplitSink<Socket, Message>;
type SocketReader = SplitStream<Socket>;

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut writer, mut reader) = establish_connection(&args).await?;
    write_stdout(&format!("*** connected to {}", args.url)).await?;

    let mut input = BufReader::new(tokio::io::stdin()).lines();

    run_client_loop(&mut reader, &mut writer, &mut input).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(SocketWriter, SocketReader)> {
    let (socket, _response) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.url))?;

    info!("connected to {}", args.url);
    Ok(socket.split())
}

async fn run_client_loop<R, W, I>(reader: &mut R, writer: &mut W, input: &mut Lines<I>) -> Result<()>
where
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    W: Sink<Message> + Unpin,
    W::Error: std::error::Error + Send + Sync + 'static,
    I: AsyncBufRead + Unpin,
{
    loop {
        select! {
            server_message = reader.next() => {
                if !handle_server_message(server_message).await? {
                    break;
                }
            }
            // `next_line` is cancel safe: a half-read line is kept across iterations.
            line = input.next_line() => {
                if !handle_stdin_input(line, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_message(
    message: Option<Result<Message, tungstenite::Error>>,
) -> Result<bool> {
    let message = match message {
        Some(message) => message.context("failed to read from hub")?,
        None => {
            write_stdout("*** server closed the connection").await?;
            return Ok(false);
        }
    };

    match message {
        Message::Text(text) => render_lines(&text).await?,
        Message::Binary(data) => render_lines(&String::from_utf8_lossy(&data)).await?,
        Message::Close(_) => {
            write_stdout("*** server closed the connection").await?;
            return Ok(false);
        }
        // Pongs for the hub's pings are queued by tungstenite itself.
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
    }
    Ok(true)
}

/// The hub packs queued messages into one frame, one per line.
async fn render_lines(text: &str) -> io::Result<()> {
    for line in text.split('\n') {
        write_stdout(line).await?;
    }
    Ok(())
}

async fn handle_stdin_input<W>(line: io::Result<Option<String>>, writer: &mut W) -> Result<bool>
where
    W: Sink<Message> + Unpin,
    W::Error: std::error::Error + Send + Sync + 'static,
{
    let Some(line) = line? else {
        return Ok(false);
    };

    let text = line.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving").await?;
        return Ok(false);
    }

    writer
        .send(Message::Text(text.to_string()))
        .await
        .context("failed to send message")?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut SocketWriter) {
    // Closing the sink performs the close handshake.
    if let Err(error) = writer.close().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
