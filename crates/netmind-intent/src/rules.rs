//! Ordered rule table — stage one of intent recognition.
//!
//! The table is closed and ordered: the first matching rule wins, ties
//! within equal priority fall to declaration order. Keyword sets cover
//! Polish and English phrasings side by side, matching how users of the
//! original assistant actually type.

use std::sync::LazyLock;

use regex::Regex;

use netmind_core::types::{Entities, IntentKind};

/// How a rule recognizes an utterance. Matching happens on the
/// lowercased text; extracted entities are available to predicates.
enum Matcher {
    /// Any of these substrings present.
    Keywords(&'static [&'static str]),
    /// One substring from each group present.
    AllOf(&'static [&'static [&'static str]]),
    /// Regular expression over the lowercased text.
    Regex(Regex),
    /// Arbitrary cheap predicate.
    Pred(fn(&str, &Entities) -> bool),
}

pub struct Rule {
    pub intent: IntentKind,
    /// Fixed confidence for a hit, in [0.6, 1.0].
    pub confidence: f64,
    matcher: Matcher,
}

impl Rule {
    pub fn matches(&self, text_lower: &str, entities: &Entities) -> bool {
        match &self.matcher {
            Matcher::Keywords(words) => words.iter().any(|w| text_lower.contains(w)),
            Matcher::AllOf(groups) => groups
                .iter()
                .all(|group| group.iter().any(|w| text_lower.contains(w))),
            Matcher::Regex(re) => re.is_match(text_lower),
            Matcher::Pred(f) => f(text_lower, entities),
        }
    }
}

fn kw(intent: IntentKind, confidence: f64, words: &'static [&'static str]) -> Rule {
    Rule {
        intent,
        confidence,
        matcher: Matcher::Keywords(words),
    }
}

fn all_of(
    intent: IntentKind,
    confidence: f64,
    groups: &'static [&'static [&'static str]],
) -> Rule {
    Rule {
        intent,
        confidence,
        matcher: Matcher::AllOf(groups),
    }
}

fn pred(intent: IntentKind, confidence: f64, f: fn(&str, &Entities) -> bool) -> Rule {
    Rule {
        intent,
        confidence,
        matcher: Matcher::Pred(f),
    }
}

/// Pattern is compiled once when the table is built; invalid patterns
/// are a programming error.
fn re(intent: IntentKind, confidence: f64, pattern: &str) -> Rule {
    Rule {
        intent,
        confidence,
        matcher: Matcher::Regex(Regex::new(pattern).expect("rule table regex")),
    }
}

fn has_ip(_t: &str, e: &Entities) -> bool {
    e.ip.is_some()
}

fn ping_with_ip(t: &str, e: &Entities) -> bool {
    e.ip.is_some()
        && ["ping", "sprawdź", "sprawdz", "check", "dostępn", "dostepn"]
            .iter()
            .any(|w| t.contains(w))
}

fn describe_with_ip(t: &str, e: &Entities) -> bool {
    e.ip.is_some()
        && ["co widać", "co widac", "what do you see", "what's on", "opisz"]
            .iter()
            .any(|w| t.contains(w))
}

fn watch_target(t: &str, e: &Entities) -> bool {
    e.primary().is_some()
        && ["monitoruj", "obserwuj", "watch", "śledź", "sledz", "pilnuj"]
            .iter()
            .any(|w| t.contains(w))
}

fn is_search(t: &str, _e: &Entities) -> bool {
    t.trim_start().starts_with('?')
}

fn has_url(_t: &str, e: &Entities) -> bool {
    e.url.is_some()
}

fn looks_like_question(t: &str, _e: &Entities) -> bool {
    t.trim_end().ends_with('?')
        || ["co ", "jak ", "dlaczego ", "kiedy ", "czy ", "what ", "how ", "why "]
            .iter()
            .any(|w| t.starts_with(w))
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        // search must win over everything a '?' query could also contain
        pred(IntentKind::BrowseSearch, 0.95, is_search),
        // monitor lifecycle, before generic probes so "monitoruj <ip>"
        // never falls through to ping
        kw(
            IntentKind::MonitorStop,
            0.9,
            &[
                "stop monitor",
                "zatrzymaj monitor",
                "przestań obserwować",
                "przestan obserwowac",
                "stop watching",
            ],
        ),
        kw(
            IntentKind::MonitorList,
            0.85,
            &[
                "lista monitor",
                "pokaż monitory",
                "pokaz monitory",
                "aktywne monitory",
                "list monitors",
                "active watches",
            ],
        ),
        kw(
            IntentKind::MonitorLogs,
            0.85,
            &["logi monitor", "historia zmian", "monitor logs", "change history"],
        ),
        kw(
            IntentKind::MonitorConfig,
            0.8,
            &["konfiguracja monitor", "ustawienia monitor", "monitor config"],
        ),
        pred(IntentKind::MonitorStart, 0.85, watch_target),
        // network probes
        kw(
            IntentKind::NetworkPortScan,
            0.9,
            &[
                "skanuj porty",
                "skan portów",
                "skan portow",
                "scan ports",
                "port scan",
                "otwarte porty",
                "open ports",
            ],
        ),
        kw(IntentKind::NetworkArp, 0.9, &["arp"]),
        kw(
            IntentKind::NetworkScan,
            0.95,
            &[
                "skanuj sieć",
                "skanuj siec",
                "skan sieci",
                "scan network",
                "network scan",
                "scan the network",
                "wykryj urządzenia",
                "wykryj urzadzenia",
                "znajdź urządzenia",
                "znajdz urzadzenia",
            ],
        ),
        pred(IntentKind::NetworkPing, 0.95, ping_with_ip),
        re(IntentKind::NetworkPing, 0.7, r"\bping\b"),
        // cameras
        pred(IntentKind::CameraDescribe, 0.9, describe_with_ip),
        kw(
            IntentKind::CameraDescribe,
            0.8,
            &["co widać", "co widac", "what do you see"],
        ),
        kw(
            IntentKind::CameraSnapshot,
            0.85,
            &["zdjęcie z kamery", "zdjecie z kamery", "snapshot", "zrzut z kamery", "klatka"],
        ),
        kw(
            IntentKind::CameraPtz,
            0.85,
            &["obróć kamer", "obroc kamer", "ptz"],
        ),
        kw(
            IntentKind::CameraHealth,
            0.85,
            &[
                "stan kamery",
                "czy kamera działa",
                "czy kamera dziala",
                "camera health",
            ],
        ),
        kw(
            IntentKind::CameraOnvif,
            0.75,
            &["kamera", "camera", "podgląd", "podglad", "live view", "onvif"],
        ),
        // remote execution
        all_of(
            IntentKind::SshText2Cmd,
            0.7,
            &[&["jakim poleceniem", "jakie polecenie", "what command"]],
        ),
        kw(IntentKind::SshExec, 0.9, &["ssh"]),
        pred(IntentKind::SshExec, 0.75, |t, e| {
            e.ip.is_some() && (t.contains("wykonaj na") || t.contains("run on"))
        }),
        // messaging and APIs
        all_of(
            IntentKind::MqttSend,
            0.85,
            &[
                &["mqtt"],
                &["wyślij", "wyslij", "send", "publish", "opublikuj"],
            ],
        ),
        kw(IntentKind::MqttRead, 0.8, &["mqtt"]),
        all_of(
            IntentKind::RestSend,
            0.8,
            &[
                &["api", "rest", "endpoint"],
                &["wyślij", "wyslij", "post", "send"],
            ],
        ),
        kw(IntentKind::RestRead, 0.7, &["rest api", "endpoint", "api "]),
        all_of(
            IntentKind::WsSend,
            0.85,
            &[&["websocket", "ws://"], &["wyślij", "wyslij", "send"]],
        ),
        re(IntentKind::WsOpen, 0.85, r"\bwebsocket\b|\bwss?://"),
        kw(
            IntentKind::SseOpen,
            0.85,
            &["sse", "server-sent", "event stream"],
        ),
        kw(IntentKind::GraphqlQuery, 0.9, &["graphql"]),
        // marketplace
        kw(
            IntentKind::MarketplaceUninstall,
            0.85,
            &["odinstaluj", "uninstall"],
        ),
        all_of(
            IntentKind::MarketplaceInstall,
            0.8,
            &[&["zainstaluj", "install"], &["wtyczk", "plugin"]],
        ),
        all_of(
            IntentKind::MarketplaceSearch,
            0.8,
            &[&["szukaj", "znajdź", "znajdz", "search"], &["wtyczk", "plugin"]],
        ),
        kw(
            IntentKind::MarketplaceBrowse,
            0.75,
            &["marketplace", "wtyczki", "plugins"],
        ),
        // voice / logs
        kw(
            IntentKind::VoiceCommand,
            0.7,
            &["głosem", "glosem", "voice command"],
        ),
        kw(
            IntentKind::LogsClear,
            0.9,
            &["wyczyść logi", "wyczysc logi", "clear logs"],
        ),
        kw(
            IntentKind::LogsDownload,
            0.9,
            &["pobierz logi", "download logs", "logi do pliku"],
        ),
        kw(
            IntentKind::LogsLevel,
            0.9,
            &["poziom logów", "poziom logow", "log level"],
        ),
        // browsing — late so monitor/api phrasings with a URL win first
        pred(IntentKind::BrowseUrl, 0.95, has_url),
        // bare address: treat as a reachability check
        pred(IntentKind::NetworkPing, 0.6, has_ip),
        // conversational fallback with real signal
        pred(IntentKind::ChatAsk, 0.6, looks_like_question),
    ]
});

/// The closed, ordered rule table.
pub fn rule_table() -> &'static [Rule] {
    &RULES
}

/// Scan the table; first hit wins.
pub fn first_match(text_lower: &str, entities: &Entities) -> Option<&'static Rule> {
    RULES.iter().find(|r| r.matches(text_lower, entities))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::extract;

    fn route(text: &str) -> Option<(IntentKind, f64)> {
        let entities = extract(text);
        first_match(&text.to_lowercase(), &entities).map(|r| (r.intent, r.confidence))
    }

    #[test]
    fn ping_with_address() {
        let (intent, conf) = route("ping 192.168.1.1").unwrap();
        assert_eq!(intent, IntentKind::NetworkPing);
        assert!(conf >= 0.9);
    }

    #[test]
    fn polish_network_scan() {
        assert_eq!(route("skanuj sieć").unwrap().0, IntentKind::NetworkScan);
        assert_eq!(route("Skanuj sieć proszę").unwrap().0, IntentKind::NetworkScan);
    }

    #[test]
    fn port_scan_wins_over_network_scan() {
        assert_eq!(
            route("skanuj porty 192.168.1.1").unwrap().0,
            IntentKind::NetworkPortScan
        );
    }

    #[test]
    fn camera_describe_with_ip() {
        let (intent, conf) = route("co widać na 192.168.1.100").unwrap();
        assert_eq!(intent, IntentKind::CameraDescribe);
        assert!(conf >= 0.9);
    }

    #[test]
    fn url_browses_search_queries() {
        assert_eq!(
            route("https://slow.example").unwrap().0,
            IntentKind::BrowseUrl
        );
        assert_eq!(route("? cena rtx 5090").unwrap().0, IntentKind::BrowseSearch);
    }

    #[test]
    fn monitor_phrases_beat_probes() {
        assert_eq!(
            route("monitoruj 192.168.1.50").unwrap().0,
            IntentKind::MonitorStart
        );
        assert_eq!(route("stop monitor abc").unwrap().0, IntentKind::MonitorStop);
    }

    #[test]
    fn mqtt_send_vs_read() {
        assert_eq!(
            route("wyślij przez mqtt temperaturę").unwrap().0,
            IntentKind::MqttSend
        );
        assert_eq!(route("pokaż dane mqtt").unwrap().0, IntentKind::MqttRead);
    }

    #[test]
    fn unmatched_text_has_no_rule() {
        assert!(route("dzień dobry").is_none());
    }

    #[test]
    fn all_confidences_in_declared_band() {
        for rule in rule_table() {
            assert!(
                (0.6..=1.0).contains(&rule.confidence),
                "{} out of band",
                rule.intent
            );
        }
    }
}
