use rmpv::Value;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// An item up for auction.
///
/// JSON uses PascalCase field names; camelCase is accepted on input, and
/// numeric fields may arrive as strings (browser form values).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Auction {
    #[serde(default, alias = "id", deserialize_with = "int_or_string")]
    pub id: i32,
    #[serde(default, alias = "itemName")]
    pub item_name: String,
    #[serde(default, alias = "currentBid", deserialize_with = "int_or_string")]
    pub current_bid: i32,
}

/// A bid announcement exchanged over the hub as a MessagePack map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuctionNotify {
    pub auction_id: i32,
    pub new_bid: i32,
}

impl Auction {
    pub fn new(id: i32, item_name: impl Into<String>, current_bid: i32) -> Self {
        Self {
            id,
            item_name: item_name.into(),
            current_bid,
        }
    }
}

/// Errors converting hub arguments into model types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("expected a map for {0}")]
    NotAMap(&'static str),

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("field '{0}' has the wrong type")]
    InvalidField(&'static str),
}

fn int_or_string<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i32),
        Str(String),
    }

    match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(n) => Ok(n),
        IntOrString::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

// MessagePack objects travel as string-keyed maps. Keys are matched
// case-insensitively so both .NET and JavaScript clients work.

fn field<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    value
        .as_map()?
        .iter()
        .find(|(key, _)| key.as_str().is_some_and(|k| k.eq_ignore_ascii_case(name)))
        .map(|(_, v)| v)
}

fn int_field(value: &Value, name: &'static str) -> Result<i32, ModelError> {
    let raw = field(value, name).ok_or(ModelError::MissingField(name))?;
    raw.as_i64()
        .and_then(|n| i32::try_from(n).ok())
        .ok_or(ModelError::InvalidField(name))
}

impl From<&AuctionNotify> for Value {
    fn from(notify: &AuctionNotify) -> Self {
        Value::Map(vec![
            (Value::from("AuctionId"), Value::from(notify.auction_id)),
            (Value::from("NewBid"), Value::from(notify.new_bid)),
        ])
    }
}

impl TryFrom<&Value> for AuctionNotify {
    type Error = ModelError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        if !value.is_map() {
            return Err(ModelError::NotAMap("AuctionNotify"));
        }
        Ok(Self {
            auction_id: int_field(value, "AuctionId")?,
            new_bid: int_field(value, "NewBid")?,
        })
    }
}

impl From<&Auction> for Value {
    fn from(auction: &Auction) -> Self {
        Value::Map(vec![
            (Value::from("Id"), Value::from(auction.id)),
            (Value::from("ItemName"), Value::from(auction.item_name.as_str())),
            (Value::from("CurrentBid"), Value::from(auction.current_bid)),
        ])
    }
}

impl TryFrom<&Value> for Auction {
    type Error = ModelError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        if !value.is_map() {
            return Err(ModelError::NotAMap("Auction"));
        }
        let item_name = field(value, "ItemName")
            .ok_or(ModelError::MissingField("ItemName"))?
            .as_str()
            .ok_or(ModelError::InvalidField("ItemName"))?
            .to_string();
        Ok(Self {
            id: int_field(value, "Id")?,
            item_name,
            current_bid: int_field(value, "CurrentBid")?,
        })
    }
}
