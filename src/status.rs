//! Translation between the local (legacy) task-status vocabulary and the
//! unified vocabulary spoken by the Hub.
//!
//! Both directions are table lookups with an identity fallback, so an
//! unrecognized status passes through unchanged instead of failing.

/// `(hub, local)` pairs. Each side is unique, which keeps the round trip exact.
const STATUS_TABLE: [(&str, &str); 7] = [
    ("pending", "backlog"),
    ("queued", "planning"),
    ("running", "in_progress"),
    ("review", "human_review"),
    ("validating", "ai_review"),
    ("completed", "done"),
    ("failed", "error"),
];

/// Map a Hub status to the local vocabulary.
pub fn map_hub_to_local(status: &str) -> &str {
    STATUS_TABLE
        .iter()
        .find(|(hub, _)| *hub == status)
        .map(|(_, local)| *local)
        .unwrap_or(status)
}

/// Map a local status to the Hub vocabulary.
pub fn map_local_to_hub(status: &str) -> &str {
    STATUS_TABLE
        .iter()
        .find(|(_, local)| *local == status)
        .map(|(hub, _)| *hub)
        .unwrap_or(status)
}

/// Hub statuses that have a local counterpart.
pub fn hub_statuses() -> impl Iterator<Item = &'static str> {
    STATUS_TABLE.iter().map(|(hub, _)| *hub)
}

/// Local statuses that have a Hub counterpart.
pub fn local_statuses() -> impl Iterator<Item = &'static str> {
    STATUS_TABLE.iter().map(|(_, local)| *local)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_keys_round_trip() {
        for status in hub_statuses() {
            assert_eq!(map_local_to_hub(map_hub_to_local(status)), status);
        }
    }

    #[test]
    fn local_keys_round_trip() {
        for status in local_statuses() {
            assert_eq!(map_hub_to_local(map_local_to_hub(status)), status);
        }
    }

    #[test]
    fn unmapped_values_pass_through() {
        assert_eq!(map_hub_to_local("archived"), "archived");
        assert_eq!(map_local_to_hub("archived"), "archived");
        assert_eq!(map_hub_to_local(""), "");
    }

    #[test]
    fn known_pairs() {
        assert_eq!(map_hub_to_local("running"), "in_progress");
        assert_eq!(map_local_to_hub("backlog"), "pending");
        assert_eq!(map_local_to_hub("done"), "completed");
    }
}
