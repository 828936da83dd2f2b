// Paper counterpart: confirms, modifies and closes orders against replayed quotes

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::instruments::InstrumentRules;
use crate::transport::{BrokerEvent, BrokerOrder, OrderAction, OrderRequest};
use crate::types::{AccountSnapshot, Direction, Quote};

const VOLUME_EPSILON: f64 = 1e-9;

/// A position the paper broker has fully closed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub ticket: u64,
    pub symbol: String,
    pub direction: Direction,
    pub volume: f64,
    pub open_price: f64,
    pub close_price: f64,
    pub pnl: f64,
    pub closed_at: DateTime<Utc>,
}

/// In-process stand-in for the broker-side agent.
///
/// Orders fill at the current quote with no slippage. Stops and targets
/// trigger on the exit side of the book when a quote crosses them.
#[derive(Debug, Clone)]
pub struct PaperBroker {
    balance: f64,
    currency: String,
    leverage: u32,
    rules: BTreeMap<String, InstrumentRules>,
    quotes: HashMap<String, Quote>,
    orders: BTreeMap<u64, BrokerOrder>,
    next_ticket: u64,
    reject_next: Option<String>,
    closed: Vec<ClosedTrade>,
}

impl PaperBroker {
    pub fn new(balance: f64, rules: BTreeMap<String, InstrumentRules>) -> Self {
        Self {
            balance,
            currency: "USD".to_string(),
            leverage: 100,
            rules,
            quotes: HashMap::new(),
            orders: BTreeMap::new(),
            next_ticket: 1000,
            reject_next: None,
            closed: Vec::new(),
        }
    }

    /// Seed an order that exists before the session starts
    pub fn with_order(mut self, order: BrokerOrder) -> Self {
        self.next_ticket = self.next_ticket.max(order.ticket + 1);
        self.orders.insert(order.ticket, order);
        self
    }

    /// Reject the next request with `reason`
    pub fn reject_next(&mut self, reason: impl Into<String>) {
        self.reject_next = Some(reason.into());
    }

    pub fn orders(&self) -> impl Iterator<Item = &BrokerOrder> {
        self.orders.values()
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn equity(&self) -> f64 {
        self.balance
            + self
                .orders
                .values()
                .filter_map(|o| self.quotes.get(&o.symbol).map(|q| self.pnl(o, o.direction.exit_price(q), o.volume)))
                .sum::<f64>()
    }

    pub fn account_event(&self) -> BrokerEvent {
        BrokerEvent::Account(AccountSnapshot {
            balance: self.balance,
            equity: self.equity(),
            currency: self.currency.clone(),
            leverage: self.leverage,
        })
    }

    pub fn open_orders_event(&self) -> BrokerEvent {
        BrokerEvent::OpenOrders {
            orders: self.orders.values().cloned().collect(),
        }
    }

    pub fn rules_events(&self) -> Vec<BrokerEvent> {
        self.rules
            .iter()
            .map(|(symbol, rules)| BrokerEvent::InstrumentRules {
                symbol: symbol.clone(),
                rules: *rules,
            })
            .collect()
    }

    fn pnl(&self, order: &BrokerOrder, exit_price: f64, volume: f64) -> f64 {
        let value_per_unit = self
            .rules
            .get(&order.symbol)
            .map(|r| r.value_per_unit())
            .unwrap_or(0.0);
        order.direction.sign() * (exit_price - order.open_price) * volume * value_per_unit
    }

    /// New market prices. Returns the quote event followed by any stop or
    /// target closes it caused.
    pub fn on_quote(&mut self, symbol: &str, bid: f64, ask: f64, at: DateTime<Utc>) -> Vec<BrokerEvent> {
        let quote = Quote { bid, ask, at };
        self.quotes.insert(symbol.to_string(), quote);
        let mut events = vec![BrokerEvent::Quote {
            symbol: symbol.to_string(),
            bid,
            ask,
            at: Some(at),
        }];

        let triggered: Vec<(u64, f64)> = self
            .orders
            .values()
            .filter(|o| o.symbol == symbol)
            .filter_map(|o| {
                let price = o.direction.exit_price(&quote);
                let sign = o.direction.sign();
                let stop_hit = o.stop_loss.filter(|sl| sign * (price - sl) <= 0.0);
                let target_hit = o.take_profit.filter(|tp| sign * (price - tp) >= 0.0);
                stop_hit.or(target_hit).map(|level| (o.ticket, level))
            })
            .collect();

        for (ticket, level) in triggered {
            if let Some(event) = self.close(ticket, None, level, at, None) {
                events.push(event);
            }
        }
        events
    }

    /// Apply one request and return the broker's answer
    pub fn execute(&mut self, request: &OrderRequest) -> Vec<BrokerEvent> {
        let token = request.token;
        if let Some(reason) = self.reject_next.take() {
            return vec![BrokerEvent::OrderRejected { token, reason }];
        }

        match &request.action {
            OrderAction::Open {
                symbol,
                direction,
                volume,
                stop_loss,
                take_profit,
                magic,
                comment,
            } => {
                let (Some(quote), Some(rules)) = (self.quotes.get(symbol), self.rules.get(symbol)) else {
                    return reject(token, "no prices for symbol");
                };
                let steps = volume / rules.lot_step;
                if *volume < rules.min_lot - VOLUME_EPSILON
                    || *volume > rules.max_lot + VOLUME_EPSILON
                    || (steps - steps.round()).abs() > 1e-6
                {
                    return reject(token, "invalid volume");
                }
                let exit = direction.exit_price(quote);
                let sign = direction.sign();
                let stops_ok = stop_loss.map_or(true, |sl| sign * (exit - sl) >= rules.stop_level - 1e-12)
                    && take_profit.map_or(true, |tp| sign * (tp - exit) >= rules.stop_level - 1e-12);
                if !stops_ok {
                    return reject(token, "invalid stops");
                }

                let order = BrokerOrder {
                    ticket: self.next_ticket,
                    symbol: symbol.clone(),
                    direction: *direction,
                    volume: *volume,
                    open_price: direction.entry_price(quote),
                    stop_loss: *stop_loss,
                    take_profit: *take_profit,
                    magic: *magic,
                    comment: comment.clone(),
                    opened_at: quote.at,
                };
                self.next_ticket += 1;
                info!(ticket = order.ticket, symbol = %order.symbol, direction = %order.direction, volume = order.volume, "📄 Paper order filled");
                self.orders.insert(order.ticket, order.clone());
                vec![BrokerEvent::OrderOpened {
                    token: Some(token),
                    order,
                }]
            }
            OrderAction::Modify {
                ticket,
                stop_loss,
                take_profit,
            } => {
                let Some(order) = self.orders.get_mut(ticket) else {
                    return reject(token, "unknown ticket");
                };
                order.stop_loss = *stop_loss;
                order.take_profit = *take_profit;
                vec![BrokerEvent::OrderModified {
                    token: Some(token),
                    ticket: *ticket,
                    stop_loss: *stop_loss,
                    take_profit: *take_profit,
                }]
            }
            OrderAction::Close { ticket, volume } => {
                let Some(order) = self.orders.get(ticket) else {
                    return reject(token, "unknown ticket");
                };
                let Some(quote) = self.quotes.get(&order.symbol).copied() else {
                    return reject(token, "no prices for symbol");
                };
                let price = order.direction.exit_price(&quote);
                match self.close(*ticket, *volume, price, quote.at, Some(token)) {
                    Some(event) => vec![event],
                    None => reject(token, "close failed"),
                }
            }
            OrderAction::RefreshInstrument { symbol } => match self.rules.get(symbol) {
                Some(rules) => vec![BrokerEvent::InstrumentRules {
                    symbol: symbol.clone(),
                    rules: *rules,
                }],
                None => reject(token, "unknown symbol"),
            },
        }
    }

    fn close(
        &mut self,
        ticket: u64,
        volume: Option<f64>,
        price: f64,
        at: DateTime<Utc>,
        token: Option<uuid::Uuid>,
    ) -> Option<BrokerEvent> {
        let order = self.orders.get(&ticket)?.clone();
        let closing = volume.unwrap_or(order.volume).min(order.volume);
        let pnl = self.pnl(&order, price, closing);
        self.balance += pnl;
        let remaining = order.volume - closing;

        if remaining > VOLUME_EPSILON {
            if let Some(open) = self.orders.get_mut(&ticket) {
                open.volume = (remaining * 1e8).round() / 1e8;
            }
            debug!(ticket, closing, remaining, pnl, "paper partial close");
            return Some(BrokerEvent::OrderPartiallyClosed {
                token,
                ticket,
                closed_volume: closing,
                remaining_volume: (remaining * 1e8).round() / 1e8,
            });
        }

        self.orders.remove(&ticket);
        info!(ticket, symbol = %order.symbol, price, pnl, "📄 Paper order closed");
        self.closed.push(ClosedTrade {
            ticket,
            symbol: order.symbol.clone(),
            direction: order.direction,
            volume: order.volume,
            open_price: order.open_price,
            close_price: price,
            pnl,
            closed_at: at,
        });
        Some(BrokerEvent::OrderClosed {
            token,
            ticket,
            close_price: Some(price),
        })
    }
}

fn reject(token: uuid::Uuid, reason: &str) -> Vec<BrokerEvent> {
    vec![BrokerEvent::OrderRejected {
        token,
        reason: reason.to_string(),
    }]
}
