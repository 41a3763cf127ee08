use base64::Engine;
use reqwest::RequestBuilder;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlot {
    Query,
    Header,
}

/// Auth with secrets already resolved by the registry. The injector never
/// performs its own secret lookup.
#[derive(Clone)]
pub enum ResolvedAuth {
    None,
    ApiKey {
        slot: KeySlot,
        field: String,
        value: String,
    },
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
}

// Credential material must never reach logs through a Debug format.
impl fmt::Debug for ResolvedAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedAuth::None => write!(f, "ResolvedAuth::None"),
            ResolvedAuth::ApiKey { slot, field, .. } => {
                write!(f, "ResolvedAuth::ApiKey({:?}, {})", slot, field)
            }
            ResolvedAuth::Bearer { .. } => write!(f, "ResolvedAuth::Bearer"),
            ResolvedAuth::Basic { .. } => write!(f, "ResolvedAuth::Basic"),
        }
    }
}

/// Attaches the declared credentials to an outgoing request. Pure: the only
/// effect is the returned builder.
pub fn apply(builder: RequestBuilder, auth: &ResolvedAuth) -> RequestBuilder {
    match auth {
        ResolvedAuth::None => builder,
        ResolvedAuth::ApiKey { slot, field, value } => match slot {
            KeySlot::Query => builder.query(&[(field.as_str(), value.as_str())]),
            KeySlot::Header => builder.header(field.as_str(), value.as_str()),
        },
        ResolvedAuth::Bearer { token } => {
            let value = if token.to_lowercase().starts_with("bearer ") {
                token.clone()
            } else {
                format!("Bearer {}", token)
            };
            builder.header("Authorization", value)
        }
        ResolvedAuth::Basic { username, password } => {
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", username, password));
            builder.header("Authorization", format!("Basic {}", encoded))
        }
    }
}
