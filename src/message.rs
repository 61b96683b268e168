//! Module that contains all the different message types sent in the network.

use crate::{clock::LogicalTimestamp, error::ExclusionError};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, fmt};

/// Struct that represents the identifier of a peer in the cluster.
///
/// Identifiers are totally ordered and double as the tie-breaker between
/// requests stamped with the same timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for PeerId {
    fn from(port: u16) -> Self {
        Self(u64::from(port))
    }
}

/// Struct that represents a peer asking for access to the critical section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    pub requester: PeerId,
    pub timestamp: LogicalTimestamp,
}

/// Struct that represents the permission a peer gives to a requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub responder: PeerId,
    /// Clock of the responder when it granted the request.
    #[serde(default)]
    pub timestamp: LogicalTimestamp,
}

/// Enum that represents the possible answers a peer sends back to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Granted(Reply),
    Refused(String),
}

impl Request {
    pub fn new(requester: PeerId, timestamp: LogicalTimestamp) -> Self {
        Self {
            requester,
            timestamp,
        }
    }

    /// Function that returns the key requests are ordered by.
    pub fn priority(&self) -> (LogicalTimestamp, PeerId) {
        (self.timestamp, self.requester)
    }

    /// Function that tells if this request must be served before `other`.
    pub fn precedes(&self, other: &Self) -> bool {
        self < other
    }

    /// Function that returns the request as a JSON formatted `String`.
    pub fn to_json_string(&self) -> Result<String, ExclusionError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Function that parses the request from a JSON formatted `String`.
    pub fn from_json_string(line: &str) -> Result<Self, ExclusionError> {
        Ok(serde_json::from_str::<Self>(line)?)
    }
}

impl Ord for Request {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority().cmp(&other.priority())
    }
}

impl PartialOrd for Request {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request{{{}, {}}}", self.requester, self.timestamp)
    }
}

impl Reply {
    pub fn new(responder: PeerId, timestamp: LogicalTimestamp) -> Self {
        Self {
            responder,
            timestamp,
        }
    }
}

impl Response {
    /// Function that returns the response as a JSON formatted `String`.
    pub fn to_json_string(&self) -> Result<String, ExclusionError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Function that parses the response from a JSON formatted `String`.
    pub fn from_json_string(line: &str) -> Result<Self, ExclusionError> {
        Ok(serde_json::from_str::<Self>(line)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(requester: u64, timestamp: u64) -> Request {
        Request::new(PeerId(requester), LogicalTimestamp(timestamp))
    }

    #[test]
    fn lower_timestamp_wins() {
        assert!(request(5002, 2).precedes(&request(5000, 3)));
        assert!(!request(5000, 3).precedes(&request(5002, 2)));
    }

    #[test]
    fn equal_timestamps_prefer_lower_id() {
        let low = request(5000, 2);
        let high = request(5001, 2);
        assert!(low.precedes(&high));
        assert!(!high.precedes(&low));
        assert_eq!(low.cmp(&high), Ordering::Less);
        assert_eq!(high.cmp(&low), Ordering::Greater);
    }

    #[test]
    fn distinct_requests_never_tie() {
        let requests = [
            request(5000, 1),
            request(5001, 1),
            request(5000, 2),
            request(5002, 2),
            request(5001, 7),
        ];
        for a in &requests {
            for b in &requests {
                if a != b {
                    assert_ne!(a.cmp(b), Ordering::Equal);
                    assert_eq!(a.precedes(b), !b.precedes(a));
                }
            }
        }
    }

    #[test]
    fn wire_format() {
        let line = request(5001, 2).to_json_string().unwrap();
        assert_eq!(line, r#"{"requester":5001,"timestamp":2}"#);

        let response = Response::from_json_string(r#"{"Granted":{"responder":5000}}"#).unwrap();
        assert_eq!(
            response,
            Response::Granted(Reply::new(PeerId(5000), LogicalTimestamp(0)))
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(Request::from_json_string("hot potato").is_err());
    }
}
