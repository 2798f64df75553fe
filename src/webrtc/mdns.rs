use serde::{Deserialize, Serialize};
use webrtc::ice::mdns::MulticastDnsMode;

/// How peer connections treat mDNS `.local` candidates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MdnsMode {
    Disabled,
    /// Resolve remote `.local` candidates without gathering our own.
    /// More stable for LAN first-connection than full gathering.
    #[default]
    QueryOnly,
    QueryAndGather,
}

impl MdnsMode {
    pub fn to_rtc(self) -> MulticastDnsMode {
        match self {
            MdnsMode::Disabled => MulticastDnsMode::Disabled,
            MdnsMode::QueryOnly => MulticastDnsMode::QueryOnly,
            MdnsMode::QueryAndGather => MulticastDnsMode::QueryAndGather,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MdnsMode::Disabled => "disabled",
            MdnsMode::QueryOnly => "query_only",
            MdnsMode::QueryAndGather => "query_and_gather",
        }
    }
}

impl std::str::FromStr for MdnsMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let value = raw.trim().to_ascii_lowercase();
        match value.as_str() {
            "disabled" | "off" | "false" | "0" => Ok(MdnsMode::Disabled),
            "query" | "query_only" | "query-only" => Ok(MdnsMode::QueryOnly),
            "gather" | "query_and_gather" | "query-and-gather" | "on" | "true" | "1" => {
                Ok(MdnsMode::QueryAndGather)
            }
            _ => Err(format!("unknown mDNS mode: {}", raw)),
        }
    }
}

pub fn mdns_host_name(session_id: &str) -> String {
    format!("{session_id}.local")
}
