// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Kinds
//!
//! The exchange types the topology manager can declare, including the delayed
//! variants provided by the `rabbitmq_delayed_message_exchange` plugin.

use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use std::collections::BTreeMap;

/// Constant for the argument used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

const DELAYED_MESSAGE_EXCHANGE: &str = "x-delayed-message";

/// Routing behaviour of an exchange.
///
/// - Direct: exact routing-key match
/// - Fanout: every bound queue
/// - Topic: wildcard routing-key match
/// - Headers: header match instead of routing key
/// - DelayedDirect / DelayedFanout: direct or fanout routing after the delay
///   in the `x-delay` header (plugin required)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    DelayedDirect,
    DelayedFanout,
}

impl ExchangeKind {
    /// Declaration arguments this kind needs.
    pub fn arguments(&self) -> FieldTable {
        let delayed_type = match self {
            ExchangeKind::DelayedDirect => "direct",
            ExchangeKind::DelayedFanout => "fanout",
            _ => return FieldTable::default(),
        };

        let mut args = BTreeMap::new();
        args.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from(delayed_type)),
        );
        FieldTable::from(args)
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::DelayedDirect | ExchangeKind::DelayedFanout => {
                lapin::ExchangeKind::Custom(DELAYED_MESSAGE_EXCHANGE.to_owned())
            }
        }
    }
}
