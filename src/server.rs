use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};

use crate::config::Settings;
use crate::db::Store;
use crate::net::{self, Cipher, Request, Response};

/// Listens for encrypted client connections and applies their requests to
/// the local store. One thread per connection; the store's own locking
/// serializes writers.
pub fn serve(settings: &Settings) -> anyhow::Result<()> {
    let key = match settings.key.as_deref() {
        Some(k) if !k.is_empty() => k,
        _ => bail!("server mode needs a non-empty passphrase, set one with -k or HISTDB_KEY"),
    };
    let cipher = Arc::new(Cipher::new(key));
    let store = Arc::new(Mutex::new(Store::open(&settings.db)?));

    let listener = TcpListener::bind(("0.0.0.0", settings.port))
        .with_context(|| format!("could not bind port {}", settings.port))?;
    tracing::info!("listening on port {}", settings.port);

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::info!("connection from {peer}");
                let log = store
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .log_connection(peer);
                if let Err(e) = log {
                    tracing::warn!("could not log connection from {peer}: {e}");
                }
                let store = Arc::clone(&store);
                let cipher = Arc::clone(&cipher);
                std::thread::spawn(move || {
                    if let Err(e) = handle_client(stream, &store, &cipher) {
                        tracing::warn!("connection from {peer} failed: {e}");
                    }
                });
            }
            Err(e) => tracing::warn!("accept error: {e}"),
        }
    }
}

/// One request, one response, then the connection closes.
fn handle_client(
    mut stream: TcpStream,
    store: &Mutex<Store>,
    cipher: &Cipher,
) -> anyhow::Result<()> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(30)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(60)));

    let request: Request = net::read_message(&mut stream, cipher)?;
    let response = match apply(store, request) {
        Ok(output) => Response::Result { output },
        Err(e) => Response::Error {
            message: e.to_string(),
        },
    };
    net::write_message(&mut stream, cipher, &response)
}

fn apply(store: &Mutex<Store>, request: Request) -> anyhow::Result<String> {
    // Every write runs in a transaction, so a store behind a poisoned
    // lock is still consistent.
    let store = store.lock().unwrap_or_else(|e| e.into_inner());
    match request {
        Request::Ingest { lines, user, host } => {
            let stats = store.ingest(&lines, &user, &host)?;
            tracing::info!("ingested batch for {user}@{host}: {stats}");
            Ok(stats.to_string())
        }
        Request::Query { params } => {
            let output = store.run_query(&params)?;
            Ok(String::from_utf8_lossy(&output).into_owned())
        }
    }
}
