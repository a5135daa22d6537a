//! Just enough implicit-TLS FTP to put a project archive on a printer's
//! storage. Bambu printers run an FTPS server on port 990 with the same
//! `bblp` / access code credentials as MQTT.

use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, error, info, trace, warn};

use std::{sync::Arc, sync::LazyLock, time::Duration};

use regex::Regex;
use rumqttc::tokio_rustls::{
    rustls::{self, pki_types::ServerName},
    TlsConnector,
};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufStream},
    net::TcpStream,
};

pub const FTPS_PORT: u16 = 990;
const FTPS_USER: &str = "bblp";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

static RE_PASV: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+),(\d+),(\d+),(\d+),(\d+),(\d+)").unwrap());

pub(super) struct FtpsClient {
    host: String,
    access_code: String,
    connector: TlsConnector,
}

impl FtpsClient {
    pub fn new(host: &str, access_code: &str, tls: Arc<rustls::ClientConfig>) -> Self {
        Self {
            host: host.to_string(),
            access_code: access_code.to_string(),
            connector: TlsConnector::from(tls),
        }
    }

    fn server_name(&self) -> Result<ServerName<'static>> {
        ServerName::try_from(self.host.clone()).map_err(|e| anyhow!("invalid host: {:?}", e))
    }

    async fn connect_tcp(&self, port: u16) -> Result<TcpStream> {
        tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((self.host.as_str(), port)),
        )
        .await
        .with_context(|| format!("timed out connecting to {}:{}", self.host, port))?
        .with_context(|| format!("connecting to {}:{}", self.host, port))
    }

    /// Stores `data` as `/{remote_name}`, replacing any file of that name
    pub async fn upload(&self, remote_name: &str, data: &[u8]) -> Result<()> {
        debug!(
            "ftps upload to {}: {} ({} bytes)",
            self.host,
            remote_name,
            data.len()
        );
        let tcp = self.connect_tcp(FTPS_PORT).await?;
        let tls = self
            .connector
            .connect(self.server_name()?, tcp)
            .await
            .context("ftps control handshake")?;
        let mut ctrl = BufStream::new(tls);

        expect_response(&mut ctrl, &[220]).await?;
        let (code, text) = send_command(&mut ctrl, &format!("USER {}", FTPS_USER)).await?;
        match code {
            230 => {}
            331 => {
                let pass = format!("PASS {}", self.access_code);
                let (code, text) = send_command(&mut ctrl, &pass).await?;
                ensure!(code == 230, "login rejected: {} {}", code, text);
            }
            _ => bail!("unexpected reply to USER: {} {}", code, text),
        }

        command_expect(&mut ctrl, "PBSZ 0", &[200]).await?;
        command_expect(&mut ctrl, "PROT P", &[200]).await?;
        command_expect(&mut ctrl, "TYPE I", &[200]).await?;

        let text = command_expect(&mut ctrl, "PASV", &[227]).await?;
        let (_, port) = parse_pasv_reply(&text)?;

        // the printer only starts the data channel handshake after STOR
        let data_tcp = self.connect_tcp(port).await?;
        command_expect(&mut ctrl, &format!("STOR /{}", remote_name), &[125, 150]).await?;

        let mut data_stream = self
            .connector
            .connect(self.server_name()?, data_tcp)
            .await
            .context("ftps data handshake")?;
        data_stream.write_all(data).await.context("ftps data write")?;
        data_stream.shutdown().await.context("ftps data close")?;
        drop(data_stream);

        expect_response(&mut ctrl, &[226, 250]).await?;
        if let Err(e) = send_command(&mut ctrl, "QUIT").await {
            trace!("QUIT: {:?}", e);
        }
        info!("uploaded {} to {}", remote_name, self.host);
        Ok(())
    }
}

async fn send_command<S>(stream: &mut S, command: &str) -> Result<(u16, String)>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    if command.starts_with("PASS ") {
        trace!("ftps > PASS ****");
    } else {
        trace!("ftps > {}", command);
    }
    stream.write_all(command.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await?;
    read_response(stream).await
}

async fn command_expect<S>(stream: &mut S, command: &str, codes: &[u16]) -> Result<String>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    let (code, text) = send_command(stream, command).await?;
    let verb = command.split_whitespace().next().unwrap_or(command);
    ensure!(
        codes.contains(&code),
        "unexpected reply to {}: {} {}",
        verb,
        code,
        text
    );
    Ok(text)
}

async fn expect_response<R: AsyncBufRead + Unpin>(reader: &mut R, codes: &[u16]) -> Result<String> {
    let (code, text) = read_response(reader).await?;
    ensure!(codes.contains(&code), "unexpected reply: {} {}", code, text);
    Ok(text)
}

/// Reads one (possibly multi-line) reply
pub(super) async fn read_response<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<(u16, String)> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        bail!("ftps connection closed");
    }
    let (code, multi) = parse_status_line(&line)?;
    let mut text = line.get(4..).unwrap_or("").trim_end().to_string();

    if multi {
        let terminator = format!("{} ", code);
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                bail!("ftps connection closed in multi-line reply");
            }
            text.push('\n');
            text.push_str(line.trim_end());
            if line.starts_with(&terminator) {
                break;
            }
        }
    }
    trace!("ftps < {} {}", code, text);
    Ok((code, text))
}

fn parse_status_line(line: &str) -> Result<(u16, bool)> {
    let code = line
        .get(..3)
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| anyhow!("malformed ftp reply: {:?}", line.trim_end()))?;
    Ok((code, line.as_bytes().get(3) == Some(&b'-')))
}

/// `227 Entering Passive Mode (192,168,1,50,195,149).`
pub(super) fn parse_pasv_reply(text: &str) -> Result<(std::net::Ipv4Addr, u16)> {
    let c = RE_PASV
        .captures(text)
        .ok_or_else(|| anyhow!("malformed PASV reply: {}", text))?;
    let n = |i: usize| -> Result<u8> {
        c[i].parse::<u8>()
            .with_context(|| format!("PASV field out of range: {}", &c[i]))
    };
    let ip = std::net::Ipv4Addr::new(n(1)?, n(2)?, n(3)?, n(4)?);
    let port = (n(5)? as u16) << 8 | n(6)? as u16;
    Ok((ip, port))
}
