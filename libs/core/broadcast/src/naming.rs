//! Queue naming.

use sha2::{Digest, Sha256};

/// Longest queue name produced.
pub const MAX_QUEUE_NAME_LEN: usize = 200;

/// Name the queue a service consumes `events` from: `service:e1,e2,...`.
///
/// Names longer than [`MAX_QUEUE_NAME_LEN`] become `service:<sha256 of the
/// full name>`, with the service prefix cut back if needed so the result
/// still fits.
pub fn resolve_queue_name<S: AsRef<str>>(service: &str, events: &[S]) -> String {
    let joined = events
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(",");
    let name = format!("{service}:{joined}");

    if name.len() <= MAX_QUEUE_NAME_LEN {
        return name;
    }

    let digest = format!("{:x}", Sha256::digest(name.as_bytes()));
    let budget = MAX_QUEUE_NAME_LEN - digest.len() - 1;
    format!("{}:{digest}", truncate_at_char_boundary(service, budget))
}

fn truncate_at_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_name() {
        assert_eq!(
            resolve_queue_name("billing", &["item.created", "order.*"]),
            "billing:item.created,order.*"
        );
    }

    #[test]
    fn test_long_name_is_hashed() {
        let event = "x".repeat(250);
        let name = resolve_queue_name("svc", &[event.as_str()]);
        assert!(name.len() <= MAX_QUEUE_NAME_LEN);
        assert!(name.starts_with("svc:"));
        assert_eq!(name.len(), "svc:".len() + 64);
        assert_eq!(name, resolve_queue_name("svc", &[event.as_str()]));
    }

    #[test]
    fn test_different_inputs_hash_differently() {
        let a = resolve_queue_name("svc", &["a".repeat(250)]);
        let b = resolve_queue_name("svc", &["b".repeat(250)]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_long_service_is_truncated() {
        let service = "ś".repeat(150);
        let name = resolve_queue_name(&service, &["item.created"]);
        assert!(name.len() <= MAX_QUEUE_NAME_LEN);
        let prefix = name.rsplit_once(':').map(|(prefix, _)| prefix).unwrap();
        assert!(service.starts_with(prefix));
        assert_eq!(prefix.len(), 134);
    }

    #[test]
    fn test_exactly_at_limit_is_kept() {
        let event = "e".repeat(MAX_QUEUE_NAME_LEN - "svc:".len());
        let name = resolve_queue_name("svc", &[event.as_str()]);
        assert_eq!(name, format!("svc:{event}"));
    }
}
