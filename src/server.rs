//! HTTP server exposing the decoder at `GET /tx/{txid}`

use crate::{Result, decoder, indexer::Indexer};
use bitcoin::Txid;
use std::io;
use tiny_http::{Header, Method, Response, Server};
use tracing::{info, warn};

/// Default listening port
pub const DEFAULT_PORT: u16 = 3000;

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// A response ready to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// HTTP status code
    pub status: u16,
    /// Value of the `Content-Type` header
    pub content_type: String,
    /// Response body
    pub body: Vec<u8>,
}

impl Reply {
    fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: TEXT_PLAIN.to_owned(),
            body: body.into().into_bytes(),
        }
    }
}

/// Routes a request. Decoded content is returned under its own content type; a
/// malformed transaction id or a failed decode answers 400 with plain text.
pub fn handle<I: Indexer + ?Sized>(indexer: &I, method: &Method, url: &str) -> Reply {
    let path = url.split('?').next().unwrap_or_default();

    let Some(txid) = path
        .strip_prefix("/tx/")
        .filter(|txid| !txid.is_empty() && !txid.contains('/'))
    else {
        return Reply::text(404, "not found");
    };

    if *method != Method::Get {
        return Reply::text(405, "method not allowed");
    }

    let Ok(txid) = txid.parse::<Txid>() else {
        return Reply::text(400, "invalid transaction id");
    };

    match decoder::extract(indexer, &txid.to_string()) {
        Ok(inscription) => Reply {
            status: 200,
            content_type: inscription.content_type,
            body: inscription.data,
        },
        Err(err) => {
            warn!(%txid, error = %err, "decode failed");
            Reply::text(400, err.to_string())
        }
    }
}

/// Serves decode requests on `port` until the process exits
pub fn serve<I: Indexer + ?Sized>(indexer: &I, port: u16) -> Result<()> {
    let server = Server::http(("0.0.0.0", port)).map_err(io::Error::other)?;

    info!(port, "listening");
    info!(
        "example: http://localhost:{}/tx/15f3b73df7e5c072becb1d84191843ba080734805addfccb650929719080f62e",
        port
    );

    for request in server.incoming_requests() {
        let reply = handle(indexer, request.method(), request.url());

        let header = Header::from_bytes(&b"Content-Type"[..], reply.content_type.as_bytes())
            .or_else(|_| Header::from_bytes(&b"Content-Type"[..], &b"application/octet-stream"[..]));
        let mut response = Response::from_data(reply.body).with_status_code(reply.status);
        if let Ok(header) = header {
            response = response.with_header(header);
        }

        if let Err(err) = request.respond(response) {
            warn!(error = %err, "failed to send response");
        }
    }

    Ok(())
}
