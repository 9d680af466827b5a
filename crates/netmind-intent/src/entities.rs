//! Entity extraction. Runs on every utterance regardless of which
//! routing stage produced the intent.

use std::sync::LazyLock;

use regex::Regex;

use netmind_core::types::Entities;

static IP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})\b").unwrap());

static MAC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b([0-9A-Fa-f]{2}(?::[0-9A-Fa-f]{2}){5}|[0-9A-Fa-f]{2}(?:-[0-9A-Fa-f]{2}){5})\b",
    )
    .unwrap()
});

static URL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"https?://[^\s"'<>]+"#).unwrap());

static PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)port\w*\D{0,3}(\d{1,5})").unwrap());

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d+)\s*(ms|s|sek\w*|sec\w*|m\b|min\w*|h\b|godz\w*|hour\w*)").unwrap()
});

static THRESHOLD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:threshold|próg|prog)\D{0,3}(\d+(?:[.,]\d+)?)").unwrap());

static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:[.,]\d+)?)\s*%").unwrap());

/// Verbs whose trailing text becomes the free `text` entity
/// ("pokaż kamery w salonie" → "kamery w salonie").
const VERBS: &[&str] = &[
    "pokaż", "pokaz", "wyświetl", "wyswietl", "sprawdź", "sprawdz", "otwórz", "otworz",
    "show", "open", "check", "describe",
];

/// Extract every recognizable entity from the utterance.
pub fn extract(text: &str) -> Entities {
    let mut entities = Entities::default();

    if let Some(ip) = find_ip(text) {
        entities.subnet = derive_subnet(&ip);
        entities.ip = Some(ip);
    }
    entities.mac = find_mac(text);

    let trimmed = text.trim();
    if let Some(query) = trimmed.strip_prefix('?') {
        // `?`-prefixed input is a search query, not a URL fetch.
        let query = query.trim();
        if !query.is_empty() {
            entities.search = Some(query.to_string());
        }
    } else {
        entities.url = URL_RE
            .find(text)
            .map(|m| m.as_str().trim_end_matches([',', '.', ')', ']']).to_string());
    }

    entities.port = PORT_RE
        .captures(text)
        .and_then(|c| c[1].parse::<u32>().ok())
        .filter(|p| (1..=65_535).contains(p))
        .map(|p| p as u16);

    entities.duration_ms = find_duration_ms(text);
    entities.threshold = THRESHOLD_RE
        .captures(text)
        .and_then(|c| parse_decimal(&c[1]))
        .map(|v| if v > 1.0 { v / 100.0 } else { v });
    entities.percent = PERCENT_RE.captures(text).and_then(|c| parse_decimal(&c[1]));

    entities.text = text_after_verb(text);

    entities
}

/// First plausible IPv4 address, skipping network/broadcast addresses and
/// loopback.
pub fn find_ip(text: &str) -> Option<String> {
    for caps in IP_RE.captures_iter(text) {
        let octets: Vec<u32> = (1..=4).filter_map(|i| caps[i].parse().ok()).collect();
        if octets.len() != 4 || octets.iter().any(|o| *o > 255) {
            continue;
        }
        if octets[0] == 127 || octets[3] == 0 || octets[3] == 255 {
            continue;
        }
        return Some(caps[0].to_string());
    }
    None
}

/// `/24` prefix of an address: `192.168.1.17` → `192.168.1.0/24`.
pub fn derive_subnet(ip: &str) -> Option<String> {
    let (prefix, _) = ip.rsplit_once('.')?;
    Some(format!("{prefix}.0/24"))
}

/// First MAC, normalized to lowercase colon-separated form.
pub fn find_mac(text: &str) -> Option<String> {
    MAC_RE
        .captures(text)
        .map(|c| c[1].to_lowercase().replace('-', ":"))
}

fn find_duration_ms(text: &str) -> Option<u64> {
    let caps = DURATION_RE.captures(text)?;
    let value: u64 = caps[1].parse().ok()?;
    let unit = caps[2].to_lowercase();
    let ms = match unit.as_str() {
        "ms" => value,
        u if u.starts_with('h') || u.starts_with("godz") => value * 3_600_000,
        u if u.starts_with('m') => value * 60_000,
        // bare "s", "sek…", "sec…"
        _ => value * 1_000,
    };
    Some(ms)
}

fn parse_decimal(s: &str) -> Option<f64> {
    s.replace(',', ".").parse().ok()
}

fn text_after_verb(text: &str) -> Option<String> {
    // Search and slice the same lowercased buffer: case folding can
    // change byte lengths, so offsets into `lower` are not valid for
    // `text`.
    let lower = text.to_lowercase();
    for verb in VERBS {
        if let Some(pos) = lower.find(verb) {
            let rest = lower[pos + verb.len()..].trim();
            if !rest.is_empty() {
                return Some(rest.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_ip_and_subnet() {
        let e = extract("ping 192.168.1.1 proszę");
        assert_eq!(e.ip.as_deref(), Some("192.168.1.1"));
        assert_eq!(e.subnet.as_deref(), Some("192.168.1.0/24"));
    }

    #[test]
    fn skips_broadcast_network_and_loopback() {
        assert_eq!(find_ip("ping 192.168.1.0"), None);
        assert_eq!(find_ip("ping 192.168.1.255"), None);
        assert_eq!(find_ip("ping 127.0.0.1"), None);
        assert_eq!(
            find_ip("najpierw 10.0.0.255 potem 10.0.0.12"),
            Some("10.0.0.12".to_string())
        );
    }

    #[test]
    fn normalizes_mac() {
        assert_eq!(
            find_mac("urządzenie AA-BB-CC-11-22-33 w sieci"),
            Some("aa:bb:cc:11:22:33".to_string())
        );
    }

    #[test]
    fn url_vs_search_query() {
        let e = extract("otwórz https://example.com/page, dzięki");
        assert_eq!(e.url.as_deref(), Some("https://example.com/page"));
        assert!(e.search.is_none());

        let e = extract("? najlepszy router wifi");
        assert_eq!(e.search.as_deref(), Some("najlepszy router wifi"));
        assert!(e.url.is_none());
    }

    #[test]
    fn port_needs_adjacent_keyword() {
        let e = extract("sprawdź port 8080 na serwerze");
        assert_eq!(e.port, Some(8080));
        let e = extract("liczba 8080 bez kontekstu");
        assert_eq!(e.port, None);
        let e = extract("na porcie 70000");
        assert_eq!(e.port, None);
    }

    #[test]
    fn durations_with_units() {
        assert_eq!(extract("przez 5 minut").duration_ms, Some(300_000));
        assert_eq!(extract("co 30s").duration_ms, Some(30_000));
        assert_eq!(extract("monitor for 2h").duration_ms, Some(7_200_000));
        assert_eq!(extract("opóźnienie 250 ms").duration_ms, Some(250));
    }

    #[test]
    fn threshold_and_percent() {
        let e = extract("próg 0.15 dla kamery");
        assert_eq!(e.threshold, Some(0.15));
        let e = extract("threshold 20");
        assert_eq!(e.threshold, Some(0.2));
        let e = extract("zmiana o 35%");
        assert_eq!(e.percent, Some(35.0));
    }

    #[test]
    fn free_text_after_verb() {
        let e = extract("pokaż kamery w salonie");
        assert_eq!(e.text.as_deref(), Some("kamery w salonie"));
        // mixed case must not break slicing
        let e = extract("Pokaż KAMERY");
        assert_eq!(e.text.as_deref(), Some("kamery"));
    }
}
