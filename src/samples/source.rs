use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::samples::types::SnapshotRecord;

pub const COINBASE_API: &str = "https://api.exchange.coinbase.com";
pub const DEPTH_LEVELS: usize = 20;

/// Level 2 order book as returned by `/products/<id>/book?level=2`.
/// Each level is `[price, size, num_orders]` with price and size as strings.
#[derive(Debug, Deserialize)]
pub struct OrderBook {
    #[serde(default)]
    pub bids: Vec<Vec<Value>>,
    #[serde(default)]
    pub asks: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn levels(raw: &[Vec<Value>]) -> Result<Vec<BookLevel>> {
    raw.iter()
        .take(DEPTH_LEVELS)
        .map(|level| {
            let price = number(level.first()).ok_or_else(|| anyhow!("bad level price {:?}", level))?;
            let size = number(level.get(1)).ok_or_else(|| anyhow!("bad level size {:?}", level))?;
            Ok(BookLevel { price, size })
        })
        .collect()
}

/// Reduces an order book to one snapshot row.
///
/// `spread_avg_L20` is the gap between the mean ask and mean bid over 20 levels per side,
/// falling back to the best-level spread when either side is shallower than that.
/// Percentages are relative to the mid price and scaled by 100.
pub fn compute_sample(
    book: &OrderBook,
    asset: &str,
    exchange: &str,
    timestamp: DateTime<Utc>,
) -> Result<SnapshotRecord> {
    let bids = levels(&book.bids)?;
    let asks = levels(&book.asks)?;

    let best_bid = bids.first().ok_or_else(|| anyhow!("order book has no bids"))?.price;
    let best_ask = asks.first().ok_or_else(|| anyhow!("order book has no asks"))?.price;

    let mid = (best_bid + best_ask) / 2.0;
    if !mid.is_finite() || mid <= 0.0 {
        return Err(anyhow!("invalid mid price {}", mid));
    }
    let spread = best_ask - best_bid;

    let spread_avg_l20 = if bids.len() < DEPTH_LEVELS || asks.len() < DEPTH_LEVELS {
        spread
    } else {
        let bid_avg = bids.iter().map(|l| l.price).sum::<f64>() / DEPTH_LEVELS as f64;
        let ask_avg = asks.iter().map(|l| l.price).sum::<f64>() / DEPTH_LEVELS as f64;
        ask_avg - bid_avg
    };

    let volume = bids.iter().chain(asks.iter()).map(|l| l.size).sum::<f64>();

    Ok(SnapshotRecord {
        timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        asset: asset.to_string(),
        exchange: exchange.to_string(),
        price: mid,
        bid: best_bid,
        ask: best_ask,
        spread,
        volume,
        spread_avg_l20,
        spread_avg_l20_pct: spread_avg_l20 / mid * 100.0,
    })
}

/// Fetches order book snapshots for one product.
#[derive(Debug, Clone)]
pub struct SampleSource {
    client: Client,
    base_url: String,
    product_id: String,
}

impl SampleSource {
    pub fn new(base_url: impl Into<String>, product_id: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            product_id: product_id.into(),
        })
    }

    pub fn coinbase(product_id: impl Into<String>, timeout: Duration) -> Result<Self> {
        Self::new(COINBASE_API, product_id, timeout)
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub async fn fetch_book(&self) -> Result<OrderBook> {
        let url = format!("{}/products/{}/book", self.base_url, self.product_id);
        let response = self
            .client
            .get(&url)
            .query(&[("level", "2")])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<OrderBook>().await?)
    }

    pub async fn fetch_sample(&self) -> Result<SnapshotRecord> {
        let book = self.fetch_book().await?;
        compute_sample(&book, &self.product_id, "Coinbase", Utc::now())
    }
}
