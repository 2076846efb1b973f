use super::{PaymentEventSource, SourceError};
use crate::events::{
    InvoiceState, SettlementEvent, SettlementEventReceiver, SettlementEventSender,
    settlement_event_channel,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::Path;
use tracing::{debug, error, info, warn};
use url::Url;

/// Settlement events from an LND node's REST gateway.
///
/// Uses `GET /v1/invoices/subscribe?settle_index=N`, which replays every
/// invoice settled after `N` and then keeps the connection open, writing one
/// JSON object per line.
pub struct LndRestSource {
    rest_url: Url,
    macaroon_hex: String,
    http_client: reqwest::Client,
}

impl LndRestSource {
    const MACAROON_HEADER: &str = "Grpc-Metadata-macaroon";

    /// Create a new LndRestSource.
    ///
    /// # Arguments
    ///
    /// * `rest_url` - Base URL of the node's REST gateway
    /// * `macaroon` - Raw (binary) invoice macaroon
    /// * `tls_cert_pem` - The node's self-signed certificate, if it is not
    ///   already trusted
    pub fn new(
        rest_url: Url,
        macaroon: &[u8],
        tls_cert_pem: Option<&[u8]>,
    ) -> Result<Self, SourceError> {
        let mut builder =
            reqwest::Client::builder().connect_timeout(std::time::Duration::from_secs(10));
        if let Some(pem) = tls_cert_pem {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
        }

        Ok(Self {
            rest_url,
            macaroon_hex: hex::encode(macaroon),
            http_client: builder.build()?,
        })
    }

    /// Create a source from the macaroon and certificate files on disk.
    pub fn from_files(
        rest_url: Url,
        macaroon_path: &Path,
        tls_cert_path: Option<&Path>,
    ) -> Result<Self, SourceError> {
        let macaroon = std::fs::read(macaroon_path).map_err(|source| SourceError::Credentials {
            what: "macaroon",
            source,
        })?;
        let cert = tls_cert_path
            .map(|path| {
                std::fs::read(path).map_err(|source| SourceError::Credentials {
                    what: "TLS certificate",
                    source,
                })
            })
            .transpose()?;
        Self::new(rest_url, &macaroon, cert.as_deref())
    }

    fn subscribe_url(&self, settle_index: u64) -> Result<Url, SourceError> {
        let mut url = self
            .rest_url
            .join("/v1/invoices/subscribe")
            .map_err(|e| SourceError::Parse(format!("Invalid REST URL: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("settle_index", &settle_index.to_string());
        Ok(url)
    }

    /// Pump the response body into the channel until it fails, ends, or the
    /// receiver goes away.
    async fn forward(response: reqwest::Response, tx: SettlementEventSender) {
        let mut body = response.bytes_stream();
        let mut decoder = LndStreamDecoder::default();

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    error!(error = %e, "LND invoice stream failed");
                    let _ = tx.send(Err(SourceError::Request(e))).await;
                    return;
                }
            };

            for item in decoder.push(&chunk) {
                let failed = item.is_err();
                if tx.send(item).await.is_err() {
                    debug!("Settlement receiver dropped, closing LND stream");
                    return;
                }
                if failed {
                    return;
                }
            }
        }

        warn!("LND invoice stream ended");
        let _ = tx.send(Err(SourceError::StreamEnded)).await;
    }
}

#[async_trait]
impl PaymentEventSource for LndRestSource {
    async fn subscribe(&self, settle_index: u64) -> Result<SettlementEventReceiver, SourceError> {
        let url = self.subscribe_url(settle_index)?;
        info!(%url, settle_index, "Subscribing to LND invoices");

        let response = self
            .http_client
            .get(url)
            .header(Self::MACAROON_HEADER, &self.macaroon_hex)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let (tx, rx) = settlement_event_channel();
        tokio::spawn(Self::forward(response, tx));
        Ok(rx)
    }

    fn name(&self) -> &'static str {
        "lnd-rest"
    }
}

/// Splits the newline-delimited JSON body into settlement events.
///
/// Chunks may end in the middle of a line; the partial line is kept until
/// the rest arrives.
#[derive(Debug, Default)]
pub struct LndStreamDecoder {
    buffer: Vec<u8>,
}

impl LndStreamDecoder {
    /// Feed a chunk and return every complete item it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<SettlementEvent, SourceError>> {
        self.buffer.extend_from_slice(chunk);

        let mut items = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            items.push(decode_line(line));
        }
        items
    }
}

#[derive(Debug, serde::Deserialize)]
struct StreamLine {
    result: Option<InvoiceItem>,
    error: Option<StreamLineError>,
}

#[derive(Debug, serde::Deserialize)]
struct StreamLineError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

// LND's REST gateway encodes uint64 fields as strings.
#[derive(Debug, serde::Deserialize)]
struct InvoiceItem {
    #[serde(default)]
    payment_request: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    settle_index: Option<String>,
}

fn decode_line(line: &[u8]) -> Result<SettlementEvent, SourceError> {
    let parsed: StreamLine = serde_json::from_slice(line)
        .map_err(|e| SourceError::Parse(format!("Invalid stream line: {}", e)))?;

    if let Some(err) = parsed.error {
        return Err(SourceError::Stream {
            code: err.code,
            message: err.message,
        });
    }

    let Some(invoice) = parsed.result else {
        return Err(SourceError::Parse("Stream line without result".to_string()));
    };

    let state = match invoice.state.as_deref() {
        Some("SETTLED") => InvoiceState::Settled,
        Some("ACCEPTED") => InvoiceState::Accepted,
        Some("CANCELED") => InvoiceState::Canceled,
        Some("OPEN") | None => InvoiceState::Open,
        Some(other) => {
            return Err(SourceError::Parse(format!("Unknown invoice state: {}", other)));
        }
    };

    let settle_index = match invoice.settle_index.as_deref() {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|e| SourceError::Parse(format!("Invalid settle index: {}", e)))?,
        None => 0,
    };

    Ok(SettlementEvent {
        payment_request: invoice.payment_request,
        state,
        settle_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_handles_split_lines() {
        let mut decoder = LndStreamDecoder::default();
        let first = br#"{"result":{"payment_request":"lnbc1","state":"SETTLED","settle_index":"41"}}
{"result":{"payment_request":"lnbc2","#;
        let items = decoder.push(first);
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].as_ref().unwrap(),
            &SettlementEvent::settled("lnbc1", 41)
        );

        let items = decoder.push(br#""state":"OPEN"}}"#);
        assert!(items.is_empty());

        let items = decoder.push(b"\n\n");
        assert_eq!(items.len(), 1);
        let open = items[0].as_ref().unwrap();
        assert_eq!(open.state, InvoiceState::Open);
        assert_eq!(open.settle_index, 0);
    }

    #[test]
    fn test_decoder_surfaces_stream_errors() {
        let mut decoder = LndStreamDecoder::default();
        let items = decoder.push(b"{\"error\":{\"code\":2,\"message\":\"permission denied\"}}\n");
        assert!(matches!(
            items.as_slice(),
            [Err(SourceError::Stream { code: 2, .. })]
        ));
    }

    #[test]
    fn test_subscribe_url_keeps_resume_position() {
        let source =
            LndRestSource::new(Url::parse("https://node.local:8080").unwrap(), &[0xab, 0x01], None)
                .unwrap();
        assert_eq!(source.macaroon_hex, "ab01");
        assert_eq!(
            source.subscribe_url(17).unwrap().as_str(),
            "https://node.local:8080/v1/invoices/subscribe?settle_index=17"
        );
    }

    #[test]
    fn test_macaroon_header_is_zero_padded_lowercase_hex() {
        let source = LndRestSource::new(
            Url::parse("https://node.local:8080").unwrap(),
            &[0x02, 0x01, 0x0a, 0xff, 0x00],
            None,
        )
        .unwrap();
        assert_eq!(source.macaroon_hex, "02010aff00");
    }
}
