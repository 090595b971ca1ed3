use crate::paths::Paths;
use crate::pid;
use crate::protocol::{self, Request, Response};
use color_eyre::eyre::{Context, bail};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

const CONNECT_RETRIES: u32 = 5;
const CONNECT_DELAY: Duration = Duration::from_millis(100);

/// Sends one request to the supervisor for `paths` and waits for its reply.
/// Fails straight away when no supervisor is running.
pub fn send_request(paths: &Paths, request: &Request) -> color_eyre::Result<Response> {
    if !pid::is_supervisor_running(paths)? {
        bail!(
            "no supervisor is running for {} (start one with `overseer run`)",
            paths.base_dir().display()
        );
    }
    let mut stream = connect_with_retry(paths, CONNECT_RETRIES, CONNECT_DELAY)?;

    let encoded = protocol::encode_request(request)?;
    stream.write_all(&encoded)?;
    stream.shutdown(std::net::Shutdown::Write)?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .context("failed to read supervisor response")?;

    let response = protocol::decode_response(&line)?;
    Ok(response)
}

fn connect_with_retry(
    paths: &Paths,
    retries: u32,
    delay: Duration,
) -> color_eyre::Result<UnixStream> {
    let socket = paths.socket_file();
    let mut attempt = 0;
    loop {
        match UnixStream::connect(&socket) {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt + 1 >= retries => {
                bail!("failed to connect to supervisor after {retries} attempts: {e}");
            }
            Err(_) => {
                attempt += 1;
                std::thread::sleep(delay);
            }
        }
    }
}
