//! Polygon 스타일 REST API 어댑터.
//!
//! - 시세: `GET /v2/aggs/ticker/{symbol}/prev` (전일 집계, 변동은 시가 대비)
//! - 배당: `GET /v3/reference/dividends`
//! - 기업 정보: `GET /v3/reference/tickers/{symbol}`
//! - 연결 확인: `GET /v1/marketstatus/now`
//!
//! 네트워크 오류, 타임아웃, 5xx는 지수 백오프로 재시도합니다.
//! 429는 재시도하지 않고 `Retry-After`와 함께 바로 반환합니다.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use clarity_core::{CompanyInfo, DividendRecord, ProviderConfig};

use crate::error::{MarketError, Result};
use crate::origin::{ConnectionProbe, OriginAdapter, PriceQuote};

// ==================== 응답 타입 ====================

#[derive(Debug, Deserialize)]
struct AggregatesResponse {
    #[serde(default)]
    results: Vec<AggregateBar>,
}

#[derive(Debug, Deserialize)]
struct AggregateBar {
    /// 종가
    c: f64,
    /// 시가
    o: f64,
    /// 타임스탬프 (밀리초)
    t: i64,
}

#[derive(Debug, Deserialize)]
struct DividendsResponse {
    #[serde(default)]
    results: Vec<DividendItem>,
}

#[derive(Debug, Deserialize)]
struct DividendItem {
    cash_amount: f64,
    currency: Option<String>,
    ex_dividend_date: NaiveDate,
    pay_date: Option<NaiveDate>,
    record_date: Option<NaiveDate>,
    declaration_date: Option<NaiveDate>,
    frequency: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct TickerDetailsResponse {
    results: Option<TickerDetails>,
}

#[derive(Debug, Deserialize)]
struct TickerDetails {
    name: String,
    primary_exchange: Option<String>,
    sic_description: Option<String>,
    description: Option<String>,
    market_cap: Option<f64>,
    currency_name: Option<String>,
    homepage_url: Option<String>,
}

fn to_decimal(value: f64, field: &str) -> Result<Decimal> {
    Decimal::try_from(value)
        .map(|d| d.round_dp(4))
        .map_err(|e| MarketError::ParseError(format!("{}: {}", field, e)))
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

// ==================== 어댑터 ====================

/// HTTP 시장 데이터 어댑터.
pub struct HttpOriginAdapter {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl std::fmt::Debug for HttpOriginAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpOriginAdapter")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl HttpOriginAdapter {
    /// 제공자 설정으로 어댑터를 생성합니다.
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("clarity/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MarketError::NetworkError(format!("HTTP client build failed: {}", e)))?;

        let api_key = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(|k| SecretString::from(k.to_string()));

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay(),
        })
    }

    fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        let key = self.api_key.as_ref().ok_or_else(|| {
            MarketError::ConfigurationMissing("provider.api_key is not set".to_string())
        })?;
        Ok(builder.bearer_auth(key.expose_secret()))
    }

    /// 상태 코드를 에러로 변환합니다.
    async fn check_status(response: Response, symbol: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        match status {
            StatusCode::TOO_MANY_REQUESTS => Err(MarketError::ProviderRateLimited {
                retry_after: parse_retry_after(&response),
            }),
            StatusCode::NOT_FOUND => Err(MarketError::SymbolNotFound(symbol.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(MarketError::Unauthorized(
                format!("provider returned {}", status),
            )),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(MarketError::ServiceError {
                    status: status.as_u16(),
                    message: body.chars().take(200).collect(),
                })
            }
        }
    }

    /// GET 요청 후 JSON을 파싱합니다. 일시적 오류는 재시도합니다.
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        symbol: &str,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0u32;

        loop {
            let request = self.authorized(self.client.get(&url).query(query))?;
            let result = match request.send().await {
                Ok(response) => match Self::check_status(response, symbol).await {
                    Ok(response) => {
                        let body = response.text().await?;
                        serde_json::from_str::<T>(&body).map_err(MarketError::from)
                    }
                    Err(e) => Err(e),
                },
                Err(e) => Err(MarketError::from(e)),
            };

            match result {
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.retry_base_delay * 2u32.saturating_pow(attempt);
                    warn!(
                        path,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient provider error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl OriginAdapter for HttpOriginAdapter {
    fn name(&self) -> &str {
        "polygon"
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    #[instrument(skip(self))]
    async fn fetch_price(&self, symbol: &str) -> Result<PriceQuote> {
        let path = format!("/v2/aggs/ticker/{}/prev", symbol);
        let response: AggregatesResponse = self
            .get_json(&path, &[("adjusted", "true".to_string())], symbol)
            .await?;

        let bar = response
            .results
            .into_iter()
            .next()
            .ok_or_else(|| MarketError::SymbolNotFound(symbol.to_string()))?;

        let price = to_decimal(bar.c, "close")?;
        let open = to_decimal(bar.o, "open")?;
        let change = price - open;
        let change_percent = if open.is_zero() {
            Decimal::ZERO
        } else {
            (change / open * Decimal::ONE_HUNDRED).round_dp(2)
        };
        let observed_at = DateTime::<Utc>::from_timestamp_millis(bar.t).unwrap_or_else(Utc::now);

        debug!(symbol, %price, "Fetched price from provider");
        Ok(PriceQuote {
            price,
            change,
            change_percent,
            previous_close: open,
            observed_at,
        })
    }

    #[instrument(skip(self))]
    async fn fetch_dividends(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DividendRecord>> {
        let query = [
            ("ticker", symbol.to_string()),
            ("ex_dividend_date.gte", from.to_string()),
            ("ex_dividend_date.lte", to.to_string()),
            ("order", "desc".to_string()),
            ("limit", "1000".to_string()),
        ];
        let response: DividendsResponse = self
            .get_json("/v3/reference/dividends", &query, symbol)
            .await?;

        response
            .results
            .into_iter()
            .map(|item| {
                Ok(DividendRecord {
                    symbol: symbol.to_string(),
                    cash_amount: to_decimal(item.cash_amount, "cash_amount")?,
                    currency: item.currency,
                    ex_dividend_date: item.ex_dividend_date,
                    pay_date: item.pay_date,
                    record_date: item.record_date,
                    declaration_date: item.declaration_date,
                    frequency: item.frequency,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn fetch_company_info(&self, symbol: &str) -> Result<CompanyInfo> {
        let path = format!("/v3/reference/tickers/{}", symbol);
        let response: TickerDetailsResponse = self.get_json(&path, &[], symbol).await?;
        let details = response
            .results
            .ok_or_else(|| MarketError::SymbolNotFound(symbol.to_string()))?;

        let market_cap = details
            .market_cap
            .map(|cap| to_decimal(cap, "market_cap"))
            .transpose()?;

        Ok(CompanyInfo {
            symbol: symbol.to_string(),
            name: details.name,
            exchange: details.primary_exchange,
            sector: None,
            industry: details.sic_description,
            description: details.description,
            market_cap,
            currency: details.currency_name.map(|c| c.to_uppercase()),
            homepage_url: details.homepage_url,
        })
    }

    async fn test_connection(&self) -> ConnectionProbe {
        let start = Instant::now();
        let result = self
            .get_json::<serde_json::Value>("/v1/marketstatus/now", &[], "")
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(_) => ConnectionProbe {
                success: true,
                latency_ms,
                message: None,
            },
            Err(e) => ConnectionProbe {
                success: false,
                latency_ms,
                message: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use rust_decimal_macros::dec;

    fn adapter(base_url: &str) -> HttpOriginAdapter {
        HttpOriginAdapter::new(&ProviderConfig {
            api_key: Some("test-key".to_string()),
            base_url: base_url.to_string(),
            max_retries: 2,
            retry_base_delay_ms: 1,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_price_parses_previous_aggregate() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v2/aggs/ticker/AAPL/prev")
            .match_query(Matcher::UrlEncoded("adjusted".into(), "true".into()))
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_body(
                r#"{"status":"OK","results":[{"T":"AAPL","c":105.0,"o":100.0,"h":106.0,"l":99.5,"v":1000,"t":1717000000000}]}"#,
            )
            .create_async()
            .await;

        let quote = adapter(&server.url()).fetch_price("AAPL").await.unwrap();
        assert_eq!(quote.price, dec!(105));
        assert_eq!(quote.change, dec!(5));
        assert_eq!(quote.change_percent, dec!(5));
        assert_eq!(quote.previous_close, dec!(100));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_429_is_provider_rate_limited() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v2/aggs/ticker/AAPL/prev")
            .match_query(Matcher::Any)
            .with_status(429)
            .with_header("retry-after", "30")
            .expect(1)
            .create_async()
            .await;

        let err = adapter(&server.url()).fetch_price("AAPL").await.unwrap_err();
        match err {
            MarketError::ProviderRateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(30)));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_404_is_symbol_not_found() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v3/reference/tickers/ZZZZ")
            .with_status(404)
            .create_async()
            .await;

        let err = adapter(&server.url())
            .fetch_company_info("ZZZZ")
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::SymbolNotFound(s) if s == "ZZZZ"));
    }

    #[tokio::test]
    async fn test_empty_results_is_symbol_not_found() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v2/aggs/ticker/NOPE/prev")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"status":"OK","resultsCount":0}"#)
            .create_async()
            .await;

        let err = adapter(&server.url()).fetch_price("NOPE").await.unwrap_err();
        assert!(matches!(err, MarketError::SymbolNotFound(_)));
    }

    #[tokio::test]
    async fn test_5xx_is_retried_then_reported() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v2/aggs/ticker/AAPL/prev")
            .match_query(Matcher::Any)
            .with_status(503)
            .with_body("unavailable")
            .expect(3)
            .create_async()
            .await;

        let err = adapter(&server.url()).fetch_price("AAPL").await.unwrap_err();
        assert!(matches!(err, MarketError::ServiceError { status: 503, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unauthorized() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v2/aggs/ticker/AAPL/prev")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async()
            .await;

        let err = adapter(&server.url()).fetch_price("AAPL").await.unwrap_err();
        assert!(err.is_auth_error());
    }

    #[tokio::test]
    async fn test_fetch_dividends() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v3/reference/dividends")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("ticker".into(), "KO".into()),
                Matcher::UrlEncoded("ex_dividend_date.gte".into(), "2024-01-01".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"results":[
                    {"cash_amount":0.485,"currency":"USD","ex_dividend_date":"2024-06-14","pay_date":"2024-07-01","frequency":4,"ticker":"KO"},
                    {"cash_amount":0.485,"currency":"USD","ex_dividend_date":"2024-03-14","frequency":4,"ticker":"KO"}
                ]}"#,
            )
            .create_async()
            .await;

        let from = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();
        let dividends = adapter(&server.url())
            .fetch_dividends("KO", from, to)
            .await
            .unwrap();

        assert_eq!(dividends.len(), 2);
        assert_eq!(dividends[0].cash_amount, dec!(0.485));
        assert_eq!(dividends[0].frequency, Some(4));
        assert!(dividends[1].pay_date.is_none());
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let adapter = HttpOriginAdapter::new(&ProviderConfig::default()).unwrap();
        assert!(!adapter.is_configured());
        let err = adapter.fetch_price("AAPL").await.unwrap_err();
        assert!(matches!(err, MarketError::ConfigurationMissing(_)));
    }

    #[tokio::test]
    async fn test_connection_probe() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v1/marketstatus/now")
            .with_status(200)
            .with_body(r#"{"market":"open"}"#)
            .create_async()
            .await;

        let probe = adapter(&server.url()).test_connection().await;
        assert!(probe.success);
        assert!(probe.message.is_none());
    }

    #[test]
    fn test_debug_redacts_key() {
        let debug = format!("{:?}", adapter("http://localhost"));
        assert!(!debug.contains("test-key"));
    }
}
