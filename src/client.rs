use std::net::TcpStream;
use std::time::Duration;

use anyhow::{bail, Context};

use crate::config::Settings;
use crate::net::{self, Cipher, Request, Response};

/// Sends one request to the configured remote and returns the server's
/// rendered output.
pub fn exchange(settings: &Settings, request: &Request) -> anyhow::Result<String> {
    let remote = settings
        .remote
        .as_deref()
        .context("client mode needs a remote, set one with -r or HISTDB_REMOTE")?;
    let key = match settings.key.as_deref() {
        Some(k) if !k.is_empty() => k,
        _ => bail!("client mode needs a non-empty passphrase, set one with -k or HISTDB_KEY"),
    };
    let cipher = Cipher::new(key);

    let mut stream = TcpStream::connect((remote, settings.port))
        .with_context(|| format!("could not connect to {remote}:{}", settings.port))?;
    let _ = stream.set_read_timeout(Some(Duration::from_secs(30)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(60)));
    tracing::debug!("connected to {remote}:{}", settings.port);

    net::write_message(&mut stream, &cipher, request)?;
    match net::read_message(&mut stream, &cipher)? {
        Response::Result { output } => Ok(output),
        Response::Error { message } => bail!("server refused the request: {message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryParams;
    use std::net::TcpListener;
    use std::path::PathBuf;

    fn settings(remote: Option<&str>, port: u16, key: Option<&str>) -> Settings {
        Settings {
            db: PathBuf::from("/unused"),
            user: "alice".into(),
            host: "devbox".into(),
            remote: remote.map(String::from),
            port,
            key: key.map(String::from),
        }
    }

    fn query_request() -> Request {
        Request::Query {
            params: QueryParams::default(),
        }
    }

    #[test]
    fn test_exchange_requires_remote() {
        let err = exchange(&settings(None, 25625, Some("sesame")), &query_request()).unwrap_err();
        assert!(err.to_string().contains("remote"));
    }

    #[test]
    fn test_exchange_requires_passphrase() {
        let err = exchange(&settings(Some("127.0.0.1"), 25625, None), &query_request()).unwrap_err();
        assert!(err.to_string().contains("passphrase"));
    }

    #[test]
    fn test_exchange_round_trips_against_live_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let cipher = Cipher::new("sesame");
            let request: Request = net::read_message(&mut stream, &cipher).unwrap();
            assert!(matches!(request, Request::Query { .. }));
            net::write_message(
                &mut stream,
                &cipher,
                &Response::Result {
                    output: "1 ls".into(),
                },
            )
            .unwrap();
        });

        let output = exchange(
            &settings(Some("127.0.0.1"), addr.port(), Some("sesame")),
            &query_request(),
        )
        .unwrap();
        assert_eq!(output, "1 ls");
        server.join().unwrap();
    }

    #[test]
    fn test_exchange_surfaces_server_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let cipher = Cipher::new("sesame");
            let _request: Request = net::read_message(&mut stream, &cipher).unwrap();
            net::write_message(
                &mut stream,
                &cipher,
                &Response::Error {
                    message: "no history row with id 7".into(),
                },
            )
            .unwrap();
        });

        let err = exchange(
            &settings(Some("127.0.0.1"), addr.port(), Some("sesame")),
            &query_request(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("no history row with id 7"));
        server.join().unwrap();
    }
}
