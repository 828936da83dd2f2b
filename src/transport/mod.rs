//! Message boundary with the broker-side agent
//!
//! The core never calls the broker synchronously. It dispatches
//! [`OrderRequest`]s, each carrying a fresh correlation token, and later
//! consumes [`BrokerEvent`]s. Confirmations and rejections echo the token of
//! the request they answer. Delivery is assumed at-least-once, so every
//! handler in the trade manager tolerates duplicates.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::instruments::InstrumentRules;
use crate::error::{TradingError, TradingResult};
use crate::types::{AccountSnapshot, Bar, Direction};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OrderAction {
    Open {
        symbol: String,
        direction: Direction,
        volume: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        magic: u64,
        comment: String,
    },
    Modify {
        ticket: u64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    },
    /// Close `volume` lots, or the whole position when `None`
    Close { ticket: u64, volume: Option<f64> },
    /// Ask the counterpart to push fresh instrument rules
    RefreshInstrument { symbol: String },
}

impl OrderAction {
    pub fn kind(&self) -> &'static str {
        match self {
            OrderAction::Open { .. } => "open",
            OrderAction::Modify { .. } => "modify",
            OrderAction::Close { .. } => "close",
            OrderAction::RefreshInstrument { .. } => "refresh_instrument",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub token: Uuid,
    pub issued_at: DateTime<Utc>,
    #[serde(flatten)]
    pub action: OrderAction,
}

impl OrderRequest {
    pub fn new(action: OrderAction, issued_at: DateTime<Utc>) -> Self {
        Self {
            token: Uuid::new_v4(),
            issued_at,
            action,
        }
    }
}

/// An open order as the broker reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub ticket: u64,
    pub symbol: String,
    pub direction: Direction,
    pub volume: f64,
    pub open_price: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    pub magic: u64,
    #[serde(default)]
    pub comment: String,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BrokerEvent {
    Account(AccountSnapshot),
    Quote {
        symbol: String,
        bid: f64,
        ask: f64,
        #[serde(default)]
        at: Option<DateTime<Utc>>,
    },
    Bar {
        symbol: String,
        bar: Bar,
    },
    /// Closed bars answering a history request, in any order
    History {
        symbol: String,
        bars: Vec<Bar>,
    },
    InstrumentRules {
        symbol: String,
        rules: InstrumentRules,
    },
    OrderOpened {
        #[serde(default)]
        token: Option<Uuid>,
        order: BrokerOrder,
    },
    OrderModified {
        #[serde(default)]
        token: Option<Uuid>,
        ticket: u64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    },
    OrderPartiallyClosed {
        #[serde(default)]
        token: Option<Uuid>,
        ticket: u64,
        closed_volume: f64,
        remaining_volume: f64,
    },
    OrderClosed {
        #[serde(default)]
        token: Option<Uuid>,
        ticket: u64,
        #[serde(default)]
        close_price: Option<f64>,
    },
    OrderRejected {
        token: Uuid,
        reason: String,
    },
    OpenOrders {
        orders: Vec<BrokerOrder>,
    },
    Heartbeat {
        at: DateTime<Utc>,
    },
}

impl BrokerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerEvent::Account(_) => "account",
            BrokerEvent::Quote { .. } => "quote",
            BrokerEvent::Bar { .. } => "bar",
            BrokerEvent::History { .. } => "history",
            BrokerEvent::InstrumentRules { .. } => "instrument_rules",
            BrokerEvent::OrderOpened { .. } => "order_opened",
            BrokerEvent::OrderModified { .. } => "order_modified",
            BrokerEvent::OrderPartiallyClosed { .. } => "order_partially_closed",
            BrokerEvent::OrderClosed { .. } => "order_closed",
            BrokerEvent::OrderRejected { .. } => "order_rejected",
            BrokerEvent::OpenOrders { .. } => "open_orders",
            BrokerEvent::Heartbeat { .. } => "heartbeat",
        }
    }

    /// Parse one JSON line from the counterpart
    pub fn from_json_line(line: &str) -> TradingResult<Self> {
        serde_json::from_str(line.trim()).map_err(|e| {
            TradingError::InvalidParameter("broker event".to_string(), e.to_string())
        })
    }
}

/// Outbound side of the boundary
pub trait OrderTransport: Send {
    fn dispatch(&mut self, request: &OrderRequest) -> TradingResult<()>;
}

/// Forwards requests to an async consumer
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<OrderRequest>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::UnboundedSender<OrderRequest>) -> Self {
        Self { tx }
    }

    pub fn pair() -> (Self, mpsc::UnboundedReceiver<OrderRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl OrderTransport for ChannelTransport {
    fn dispatch(&mut self, request: &OrderRequest) -> TradingResult<()> {
        self.tx
            .send(request.clone())
            .map_err(|_| TradingError::DispatchFailed("order channel closed".to_string()))
    }
}

/// Keeps every dispatched request; can be told to fail
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<OrderRequest>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<OrderRequest> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Drain what has been sent so far
    pub fn take(&self) -> Vec<OrderRequest> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl OrderTransport for RecordingTransport {
    fn dispatch(&mut self, request: &OrderRequest) -> TradingResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TradingError::DispatchFailed("transport unavailable".to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        Ok(())
    }
}

/// Writes one JSON object per line
pub struct JsonLinesTransport<W: Write + Send> {
    writer: W,
}

impl JsonLinesTransport<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> JsonLinesTransport<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> OrderTransport for JsonLinesTransport<W> {
    fn dispatch(&mut self, request: &OrderRequest) -> TradingResult<()> {
        let line = serde_json::to_string(request)
            .map_err(|e| TradingError::DispatchFailed(format!("cannot encode request: {}", e)))?;
        writeln!(self.writer, "{}", line)
            .and_then(|_| self.writer.flush())
            .map_err(|e| TradingError::DispatchFailed(e.to_string()))
    }
}
