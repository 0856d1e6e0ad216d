use crate::error::Result;
use std::time::Duration;
use hickory_proto::{
    op::{Message, MessageType, ResponseCode},
    rr::{DNSClass, RecordType},
};

pub const DNS_PORT: u16 = 53;

/// Length of the fixed DNS header; the ID lives in its first two bytes.
const DNS_HEADER_LEN: usize = 12;

pub fn parse_data_to_dns_message(data: &[u8], used_by_tcp: bool) -> Result<Message> {
    if used_by_tcp {
        if data.len() < 2 {
            return Err("invalid dns data".into());
        }
        let len = u16::from_be_bytes([data[0], data[1]]) as usize;
        let data = data.get(2..len + 2).ok_or("invalid dns data")?;
        return parse_data_to_dns_message(data, false);
    }
    let message = Message::from_vec(data)?;
    Ok(message)
}

pub fn remove_ipv6_entries(message: &mut Message) {
    let answers = message.take_answers();
    message.insert_answers(answers.into_iter().filter(|answer| answer.record_type() != RecordType::AAAA).collect());
}

pub fn extract_domain_from_dns_message(message: &Message) -> Result<String> {
    let query = message.queries().first().ok_or("DnsRequest no query body")?;
    let name = query.name().to_string();
    Ok(name)
}

/// Reads the transaction ID without decoding the rest of the message.
pub fn message_id(data: &[u8]) -> Option<u16> {
    if data.len() < DNS_HEADER_LEN {
        return None;
    }
    Some(u16::from_be_bytes([data[0], data[1]]))
}

pub fn rewrite_message_id(data: &mut [u8], id: u16) {
    if data.len() >= DNS_HEADER_LEN {
        data[..2].copy_from_slice(&id.to_be_bytes());
    }
}

/// Re-encodes a stored response for replay: every answer TTL is lowered by
/// `elapsed` (floored at zero) and the transaction ID is set to `id`.
pub fn age_response(data: &[u8], elapsed: Duration, id: u16) -> Result<Vec<u8>> {
    let mut message = Message::from_vec(data)?;
    let elapsed = u32::try_from(elapsed.as_secs()).unwrap_or(u32::MAX);
    let mut answers = message.take_answers();
    for answer in answers.iter_mut() {
        answer.set_ttl(answer.ttl().saturating_sub(elapsed));
    }
    message.insert_answers(answers);
    let mut response = message.to_vec()?;
    rewrite_message_id(&mut response, id);
    Ok(response)
}

pub fn is_response(message: &Message) -> bool {
    message.message_type() == MessageType::Response
}

/// Identity of the first question in a message: lowercased name, type and class.
#[derive(Hash, Clone, Eq, PartialEq, Debug)]
pub struct QuestionKey {
    pub name: String,
    pub record_type: RecordType,
    pub class: DNSClass,
}

impl QuestionKey {
    pub fn from_message(message: &Message) -> Option<Self> {
        let query = message.queries().first()?;
        Some(Self {
            name: query.name().to_ascii().to_ascii_lowercase(),
            record_type: query.query_type(),
            class: query.query_class(),
        })
    }
}

impl std::fmt::Display for QuestionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} {} {}", self.name, self.class, self.record_type)
    }
}

/// Smallest TTL across the answer section, or `None` when the message is not
/// worth caching (error rcode or no answers).
pub fn min_answer_ttl(message: &Message) -> Option<u32> {
    if message.response_code() != ResponseCode::NoError {
        return None;
    }
    message.answers().iter().map(|answer| answer.ttl()).min()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hickory_proto::{
        op::Query,
        rr::{Name, RData, Record, rdata::A},
    };
    use std::{net::Ipv4Addr, str::FromStr};

    pub(crate) fn build_query(id: u16, domain: &str) -> Vec<u8> {
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(Name::from_str(domain).unwrap(), RecordType::A));
        message.to_vec().unwrap()
    }

    pub(crate) fn build_response(query: &[u8], ip: Ipv4Addr, ttl: u32) -> Vec<u8> {
        let mut message = Message::from_vec(query).unwrap();
        let name = message.queries()[0].name().clone();
        message.set_message_type(MessageType::Response);
        message.add_answer(Record::from_rdata(name, ttl, RData::A(A(ip))));
        message.to_vec().unwrap()
    }

    #[test]
    fn message_id_needs_a_full_header() {
        assert_eq!(message_id(&[0x12, 0x34]), None);
        let query = build_query(0x1234, "example.org.");
        assert_eq!(message_id(&query), Some(0x1234));
    }

    #[test]
    fn rewrite_id_keeps_the_body() {
        let mut query = build_query(7, "example.org.");
        let body = query[2..].to_vec();
        rewrite_message_id(&mut query, 42);
        assert_eq!(message_id(&query), Some(42));
        assert_eq!(&query[2..], &body[..]);
    }

    #[test]
    fn question_key_is_case_insensitive() {
        let a = Message::from_vec(&build_query(1, "Example.ORG.")).unwrap();
        let b = Message::from_vec(&build_query(2, "example.org.")).unwrap();
        assert_eq!(QuestionKey::from_message(&a), QuestionKey::from_message(&b));
    }

    #[test]
    fn min_ttl_of_response() {
        let query = build_query(1, "example.org.");
        let response = build_response(&query, Ipv4Addr::new(93, 184, 216, 34), 120);
        let message = Message::from_vec(&response).unwrap();
        assert!(is_response(&message));
        assert_eq!(min_answer_ttl(&message), Some(120));
        assert_eq!(min_answer_ttl(&Message::from_vec(&query).unwrap()), None);
    }

    #[test]
    fn aged_response_counts_ttl_down() {
        let query = build_query(1, "example.org.");
        let response = build_response(&query, Ipv4Addr::new(93, 184, 216, 34), 300);

        let aged = age_response(&response, Duration::from_secs(100), 9).unwrap();
        let message = Message::from_vec(&aged).unwrap();
        assert_eq!(message.id(), 9);
        assert_eq!(message.answers()[0].ttl(), 200);

        let expired = age_response(&response, Duration::from_secs(400), 9).unwrap();
        assert_eq!(min_answer_ttl(&Message::from_vec(&expired).unwrap()), Some(0));
    }
}
