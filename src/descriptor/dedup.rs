//! First-wins deduplication by descriptor identity.

use std::collections::HashSet;

use super::EndpointDescriptor;

/// Drop every descriptor whose identity was already seen, keeping order.
pub fn dedup(descriptors: Vec<EndpointDescriptor>) -> Vec<EndpointDescriptor> {
    let mut seen = HashSet::with_capacity(descriptors.len());
    descriptors
        .into_iter()
        .filter(|d| seen.insert(d.key()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Protocol;

    #[test]
    fn test_dedup_keeps_first_and_order() {
        let list = vec![
            EndpointDescriptor::new(Protocol::Vless, "a", 443, "id").with_label("first"),
            EndpointDescriptor::new(Protocol::Trojan, "b", 443, "pw"),
            EndpointDescriptor::new(Protocol::Vless, "a", 443, "id").with_label("second"),
            EndpointDescriptor::new(Protocol::Vless, "a", 8443, "id"),
        ];
        let out = dedup(list);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].label, "first");
        assert_eq!(out[1].host, "b");
        assert_eq!(out[2].port, 8443);
    }

    #[test]
    fn test_shadowsocks_password_rotation_is_not_a_duplicate() {
        let links = "\
ss://aes-256-gcm:stale@9.9.9.9:8388#old
ss://aes-256-gcm:fresh@9.9.9.9:8388#new
ss://aes-256-gcm:stale@9.9.9.9:8388#repeat
";
        let out = dedup(crate::descriptor::parse::parse_text(links));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].label, "old");
        assert_eq!(out[1].label, "new");
    }
}
