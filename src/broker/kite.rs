use std::time::Duration;

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use super::{BrokerClient, SymbolStatus};
use crate::error::{BrokerError, BrokerErrorKind};
use crate::order::{Order, OrderType, Side};

const KITE_VERSION: &str = "3";
const CALL_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
struct OrderPayload<'a> {
    exchange: &'a str,
    tradingsymbol: &'a str,
    transaction_type: &'a str,
    order_type: &'a str,
    variety: &'a str,
    quantity: u32,
    product: &'a str,
    validity: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderResponseData {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    status: String,
    data: Option<OrderResponseData>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    #[serde(default)]
    data: std::collections::HashMap<String, serde_json::Value>,
}

/// Reference `BrokerClient` adapter against Zerodha's Kite Connect wire
/// format: form-urlencoded POSTs to `/orders/regular` and `/orders/amo`,
/// `Authorization: token {api_key}:{access_token}`.
pub struct KiteBrokerClient {
    client: Client,
    base_url: String,
    api_key: String,
    access_token: String,
    product: String,
}

impl KiteBrokerClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, access_token: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(CALL_DEADLINE)
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            access_token: access_token.into(),
            product: "CNC".to_string(),
        })
    }

    fn auth_header(&self) -> String {
        format!("token {}:{}", self.api_key, self.access_token)
    }

    fn payload<'a>(&'a self, order: &'a Order, variety: &'a str) -> OrderPayload<'a> {
        OrderPayload {
            exchange: &order.exchange,
            tradingsymbol: &order.symbol,
            transaction_type: match order.side {
                Side::Buy => "BUY",
                Side::Sell => "SELL",
            },
            order_type: match order.order_type {
                OrderType::Market => "MARKET",
                OrderType::Limit => "LIMIT",
            },
            variety,
            quantity: order.quantity,
            product: &self.product,
            validity: "DAY",
            price: matches!(order.order_type, OrderType::Limit).then(|| order.price.to_string()),
        }
    }

    #[instrument(skip(self, order, cancel), fields(order_id = %order.id, symbol = %order.symbol))]
    async fn place(&self, order: &Order, variety: &'static str, cancel: &CancellationToken) -> Result<String, BrokerError> {
        let path = match variety {
            "amo" => "orders/amo",
            _ => "orders/regular",
        };
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let body = self.payload(order, variety);

        let backoff_policy = ExponentialBackoff {
            max_elapsed_time: Some(CALL_DEADLINE),
            ..ExponentialBackoff::default()
        };

        let call = retry(backoff_policy, || async {
            let response = self
                .client
                .post(&url)
                .header("X-Kite-Version", KITE_VERSION)
                .header("Authorization", self.auth_header())
                .form(&body)
                .send()
                .await
                .map_err(|e| classify_transport_error(&e))?;

            let status = response.status();
            let text = response.text().await.unwrap_or_default();

            if status.is_success() {
                let parsed: OrderResponse = serde_json::from_str(&text)
                    .map_err(|e| backoff::Error::permanent(BrokerError::new(BrokerErrorKind::Unknown, e.to_string())))?;
                if parsed.status == "success" {
                    if let Some(data) = parsed.data {
                        return Ok(data.order_id);
                    }
                }
                return Err(backoff::Error::permanent(BrokerError::new(
                    BrokerErrorKind::Unknown,
                    parsed.message.unwrap_or_else(|| "missing order id in success response".to_string()),
                )));
            }

            let kind = classify_http_error(status, &text);
            let err = BrokerError::new(kind, truncate(&text, 512));
            match kind {
                BrokerErrorKind::Network | BrokerErrorKind::Server => {
                    warn!(%status, "transient broker error, retrying");
                    Err(backoff::Error::transient(err))
                }
                _ => Err(backoff::Error::permanent(err)),
            }
        });

        tokio::select! {
            outcome = call => outcome,
            _ = cancel.cancelled() => {
                warn!("broker call aborted by shutdown signal before completion");
                Err(BrokerError::new(BrokerErrorKind::Network, "aborted by shutdown signal"))
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max])
    }
}

fn classify_transport_error(e: &reqwest::Error) -> backoff::Error<BrokerError> {
    let err = BrokerError::new(BrokerErrorKind::Network, e.to_string());
    if e.is_timeout() || e.is_connect() {
        backoff::Error::transient(err)
    } else {
        backoff::Error::permanent(err)
    }
}

/// Classifies an HTTP outcome into the error taxonomy by inspecting both the
/// status code and the response body, since the broker sometimes reports
/// auth failures (e.g. "invalid refresh token") under a 400 status.
fn classify_http_error(status: StatusCode, body: &str) -> BrokerErrorKind {
    let lower = body.to_ascii_lowercase();
    if lower.contains("token") && (lower.contains("invalid") || lower.contains("expired")) {
        return BrokerErrorKind::Auth;
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BrokerErrorKind::Auth,
        StatusCode::TOO_MANY_REQUESTS => BrokerErrorKind::RateLimited,
        s if s.is_client_error() => BrokerErrorKind::Invalid,
        s if s.is_server_error() => BrokerErrorKind::Server,
        _ => BrokerErrorKind::Unknown,
    }
}

#[async_trait]
impl BrokerClient for KiteBrokerClient {
    async fn place_regular(&self, order: &Order, cancel: &CancellationToken) -> Result<String, BrokerError> {
        self.place(order, "regular", cancel).await
    }

    async fn place_amo(&self, order: &Order, cancel: &CancellationToken) -> Result<String, BrokerError> {
        self.place(order, "amo", cancel).await
    }

    async fn health(&self) -> Result<(), BrokerError> {
        let url = format!("{}/user/profile", self.base_url.trim_end_matches('/'));
        self.client
            .get(&url)
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| BrokerError::new(BrokerErrorKind::Network, e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self), fields(%exchange, %symbol))]
    async fn validate_symbol(&self, exchange: &str, symbol: &str) -> Result<SymbolStatus, BrokerError> {
        let instrument = format!("{exchange}:{symbol}");
        let url = format!("{}/quote", self.base_url.trim_end_matches('/'));

        let response = self
            .client
            .get(&url)
            .header("X-Kite-Version", KITE_VERSION)
            .header("Authorization", self.auth_header())
            .query(&[("i", instrument.as_str())])
            .send()
            .await
            .map_err(|e| BrokerError::new(BrokerErrorKind::Network, e.to_string()))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if status.is_success() {
            let parsed: QuoteResponse = serde_json::from_str(&text)
                .map_err(|e| BrokerError::new(BrokerErrorKind::Unknown, e.to_string()))?;
            return Ok(if parsed.data.contains_key(&instrument) {
                SymbolStatus::Known
            } else {
                SymbolStatus::Unknown
            });
        }

        match classify_http_error(status, &text) {
            // Permission-denied means we can't confirm the symbol's validity
            // from this token's scope; treat it as Known rather than blocking
            // ingestion on an access restriction unrelated to the symbol.
            BrokerErrorKind::Auth => Ok(SymbolStatus::Known),
            BrokerErrorKind::Invalid => Ok(SymbolStatus::Unknown),
            kind => Err(BrokerError::new(kind, truncate(&text, 512))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_token_message_as_auth_even_on_400() {
        let kind = classify_http_error(StatusCode::BAD_REQUEST, "invalid refresh token");
        assert_eq!(kind, BrokerErrorKind::Auth);
    }

    #[test]
    fn classifies_429_as_rate_limited() {
        assert_eq!(
            classify_http_error(StatusCode::TOO_MANY_REQUESTS, ""),
            BrokerErrorKind::RateLimited
        );
    }

    #[test]
    fn classifies_5xx_as_server() {
        assert_eq!(
            classify_http_error(StatusCode::BAD_GATEWAY, ""),
            BrokerErrorKind::Server
        );
    }

    #[test]
    fn classifies_plain_400_as_invalid() {
        assert_eq!(
            classify_http_error(StatusCode::BAD_REQUEST, "quantity must be positive"),
            BrokerErrorKind::Invalid
        );
    }

    fn sample_order(is_amo: bool) -> Order {
        Order {
            id: "o1".to_string(),
            symbol: "TCS".to_string(),
            exchange: "NSE".to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: rust_decimal::Decimal::new(350050, 2),
            quantity: 10,
            scheduled_instant: chrono::Utc::now(),
            is_amo,
            created_instant: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn place_regular_posts_kite_form_fields_and_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/orders/regular")
            .match_header("x-kite-version", "3")
            .match_header("authorization", "token key1:token1")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::Regex("exchange=NSE".into()),
                mockito::Matcher::Regex("tradingsymbol=TCS".into()),
                mockito::Matcher::Regex("transaction_type=BUY".into()),
                mockito::Matcher::Regex("variety=regular".into()),
                mockito::Matcher::Regex("quantity=10".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"status":"success","data":{"order_id":"240101000000001"}}"#)
            .create_async()
            .await;

        let client = KiteBrokerClient::new(server.url(), "key1", "token1").unwrap();
        let cancel = CancellationToken::new();
        let reference = client.place_regular(&sample_order(false), &cancel).await.unwrap();

        assert_eq!(reference, "240101000000001");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn place_amo_posts_to_amo_path_with_variety_field() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/orders/amo")
            .match_body(mockito::Matcher::Regex("variety=amo".into()))
            .with_status(200)
            .with_body(r#"{"status":"success","data":{"order_id":"240101000000002"}}"#)
            .create_async()
            .await;

        let client = KiteBrokerClient::new(server.url(), "key1", "token1").unwrap();
        let cancel = CancellationToken::new();
        let reference = client.place_amo(&sample_order(true), &cancel).await.unwrap();

        assert_eq!(reference, "240101000000002");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn place_regular_classifies_401_as_auth_without_retry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/orders/regular")
            .with_status(401)
            .with_body(r#"{"status":"error","message":"invalid access token"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = KiteBrokerClient::new(server.url(), "key1", "token1").unwrap();
        let cancel = CancellationToken::new();
        let err = client.place_regular(&sample_order(false), &cancel).await.unwrap_err();

        assert_eq!(err.kind, BrokerErrorKind::Auth);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn validate_symbol_known_when_quote_present() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/quote")
            .match_query(mockito::Matcher::UrlEncoded("i".into(), "NSE:TCS".into()))
            .with_status(200)
            .with_body(r#"{"status":"success","data":{"NSE:TCS":{"last_price":3500.5}}}"#)
            .create_async()
            .await;

        let client = KiteBrokerClient::new(server.url(), "key1", "token1").unwrap();
        let status = client.validate_symbol("NSE", "TCS").await.unwrap();
        assert_eq!(status, SymbolStatus::Known);
    }

    #[tokio::test]
    async fn validate_symbol_permission_denied_falls_back_to_known() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/quote")
            .with_status(403)
            .with_body(r#"{"status":"error","message":"permission denied"}"#)
            .create_async()
            .await;

        let client = KiteBrokerClient::new(server.url(), "key1", "token1").unwrap();
        let status = client.validate_symbol("NSE", "TCS").await.unwrap();
        assert_eq!(status, SymbolStatus::Known);
    }

    #[tokio::test]
    async fn validate_symbol_unknown_instrument_input_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/quote")
            .with_status(400)
            .with_body(r#"{"status":"error","message":"no instruments to fetch quote"}"#)
            .create_async()
            .await;

        let client = KiteBrokerClient::new(server.url(), "key1", "token1").unwrap();
        let status = client.validate_symbol("NSE", "NOSUCH").await.unwrap();
        assert_eq!(status, SymbolStatus::Unknown);
    }
}
