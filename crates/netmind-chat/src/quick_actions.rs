//! Context-derived follow-up actions for assistant messages.
//!
//! Ordered category rules; at most two actions per category and five
//! per message. Labels are Polish-first, matching how the assistant
//! renders its own suggestions.

use serde::{Deserialize, Serialize};

use netmind_core::types::{Entities, IntentKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuickActionKind {
    /// Prefilled command, runs immediately on tap.
    Execute { query: String },
    /// Partially filled command; the user edits before submitting.
    Prefill { text: String },
    /// Open a URL.
    Link { url: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickAction {
    pub id: String,
    pub label: String,
    #[serde(flatten)]
    pub kind: QuickActionKind,
}

impl QuickAction {
    fn execute(id: String, label: String, query: String) -> Self {
        Self {
            id,
            label,
            kind: QuickActionKind::Execute { query },
        }
    }

    fn prefill(id: String, label: String, text: String) -> Self {
        Self {
            id,
            label,
            kind: QuickActionKind::Prefill { text },
        }
    }

    fn link(id: String, label: String, url: String) -> Self {
        Self {
            id,
            label,
            kind: QuickActionKind::Link { url },
        }
    }
}

const MAX_ACTIONS: usize = 5;
const MAX_PER_CATEGORY: usize = 2;

/// Resolve up to five follow-up actions for an assistant message.
pub fn resolve(intent: IntentKind, entities: &Entities, message_text: &str) -> Vec<QuickAction> {
    let mut actions: Vec<QuickAction> = Vec::new();
    let text_lower = message_text.to_lowercase();
    let ip = entities.ip.as_deref();
    let url = entities.url.as_deref();

    let push_category = |candidates: Vec<QuickAction>, actions: &mut Vec<QuickAction>| {
        let mut taken = 0;
        for action in candidates {
            if taken >= MAX_PER_CATEGORY || actions.len() >= MAX_ACTIONS {
                break;
            }
            if actions.iter().any(|a| a.id == action.id) {
                continue; // dedup by id
            }
            actions.push(action);
            taken += 1;
        }
    };

    let camera_context = matches!(
        intent,
        IntentKind::CameraOnvif
            | IntentKind::CameraSnapshot
            | IntentKind::CameraDescribe
            | IntentKind::CameraHealth
            | IntentKind::CameraPtz
    ) || text_lower.contains("kamer")
        || text_lower.contains("camera");

    // camera: live preview, snapshot, then monitoring
    if camera_context {
        if let Some(ip) = ip {
            push_category(
                vec![
                    QuickAction::execute(
                        format!("camera-live:{ip}"),
                        format!("Podgląd kamery {ip}"),
                        format!("pokaż kamerę {ip}"),
                    ),
                    QuickAction::execute(
                        format!("camera-snapshot:{ip}"),
                        format!("Zdjęcie z kamery {ip}"),
                        format!("zdjęcie z kamery {ip}"),
                    ),
                ],
                &mut actions,
            );
            push_category(
                vec![QuickAction::execute(
                    format!("monitor:{ip}"),
                    format!("Monitoruj {ip}"),
                    format!("monitoruj {ip}"),
                )],
                &mut actions,
            );
        }
    }

    // scan results: drill into a discovered host
    if intent == IntentKind::NetworkScan {
        if let Some(ip) = ip {
            push_category(
                vec![
                    QuickAction::execute(
                        format!("ping:{ip}"),
                        format!("Ping {ip}"),
                        format!("ping {ip}"),
                    ),
                    QuickAction::execute(
                        format!("port-scan:{ip}"),
                        format!("Skanuj porty {ip}"),
                        format!("skanuj porty {ip}"),
                    ),
                ],
                &mut actions,
            );
        }
        if let Some(subnet) = entities.subnet.as_deref() {
            push_category(
                vec![QuickAction::execute(
                    format!("rescan:{subnet}"),
                    format!("Skanuj ponownie {subnet}"),
                    "skanuj sieć".to_string(),
                )],
                &mut actions,
            );
        }
    }

    // ping result: next steps for a reachable host
    if intent == IntentKind::NetworkPing {
        if let Some(ip) = ip {
            push_category(
                vec![
                    QuickAction::execute(
                        format!("port-scan:{ip}"),
                        format!("Skanuj porty {ip}"),
                        format!("skanuj porty {ip}"),
                    ),
                    QuickAction::prefill(
                        format!("ssh:{ip}"),
                        format!("SSH {ip}"),
                        format!("ssh root@{ip} "),
                    ),
                ],
                &mut actions,
            );
        }
    }

    // port-scan result: act on open ports
    if intent == IntentKind::NetworkPortScan {
        if let Some(ip) = ip {
            let mut candidates = Vec::new();
            if text_lower.contains("22") {
                candidates.push(QuickAction::prefill(
                    format!("ssh:{ip}"),
                    format!("SSH {ip}"),
                    format!("ssh root@{ip} "),
                ));
            }
            if text_lower.contains("80") || text_lower.contains("443") {
                candidates.push(QuickAction::link(
                    format!("browse:{ip}"),
                    format!("Otwórz http://{ip}"),
                    format!("http://{ip}"),
                ));
            }
            push_category(candidates, &mut actions);
            push_category(
                vec![QuickAction::execute(
                    format!("monitor:{ip}"),
                    format!("Monitoruj {ip}"),
                    format!("monitoruj {ip}"),
                )],
                &mut actions,
            );
        }
    }

    // browse result: refresh or search on
    if matches!(intent, IntentKind::BrowseUrl | IntentKind::BrowseSearch) {
        if let Some(url) = url {
            push_category(
                vec![
                    QuickAction::execute(
                        format!("refresh:{url}"),
                        "Odśwież".to_string(),
                        url.to_string(),
                    ),
                    QuickAction::prefill(
                        "search-more".to_string(),
                        "Szukaj dalej".to_string(),
                        "? ".to_string(),
                    ),
                ],
                &mut actions,
            );
        }
    }

    // ssh result: common diagnostics on the same host
    if intent == IntentKind::SshExec {
        if let Some(ip) = ip {
            push_category(
                vec![
                    QuickAction::execute(
                        format!("ssh-df:{ip}"),
                        "Zajętość dysku".to_string(),
                        format!("ssh root@{ip} df -h"),
                    ),
                    QuickAction::execute(
                        format!("ssh-top:{ip}"),
                        "Procesy".to_string(),
                        format!("ssh root@{ip} top -b -n 1"),
                    ),
                ],
                &mut actions,
            );
        }
    }

    // monitoring context
    if matches!(
        intent,
        IntentKind::MonitorStart | IntentKind::MonitorList | IntentKind::MonitorLogs
    ) {
        push_category(
            vec![
                QuickAction::execute(
                    "monitor-logs".to_string(),
                    "Logi monitorów".to_string(),
                    "logi monitora".to_string(),
                ),
                QuickAction::execute(
                    "monitor-list".to_string(),
                    "Lista monitorów".to_string(),
                    "lista monitorów".to_string(),
                ),
            ],
            &mut actions,
        );
    }

    // conversational fallback: canned starters, or generic probes when
    // an address is present without task context
    if matches!(intent, IntentKind::ChatAsk | IntentKind::ChatFallback) {
        match (ip, url) {
            (Some(ip), _) => push_category(
                vec![QuickAction::execute(
                    format!("ping:{ip}"),
                    format!("Ping {ip}"),
                    format!("ping {ip}"),
                )],
                &mut actions,
            ),
            (None, Some(url)) => push_category(
                vec![QuickAction::link(
                    format!("browse:{url}"),
                    "Otwórz stronę".to_string(),
                    url.to_string(),
                )],
                &mut actions,
            ),
            (None, None) => push_category(
                vec![
                    QuickAction::execute(
                        "starter-scan".to_string(),
                        "Skanuj sieć".to_string(),
                        "skanuj sieć".to_string(),
                    ),
                    QuickAction::prefill(
                        "starter-search".to_string(),
                        "Wyszukaj w sieci".to_string(),
                        "? ".to_string(),
                    ),
                ],
                &mut actions,
            ),
        }
    }

    actions.truncate(MAX_ACTIONS);
    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_ip(ip: &str) -> Entities {
        Entities {
            ip: Some(ip.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn ping_result_offers_port_scan() {
        let actions = resolve(
            IntentKind::NetworkPing,
            &with_ip("192.168.1.1"),
            "192.168.1.1 Dostępny (4/4 pakiety)",
        );
        let labels: Vec<_> = actions.iter().map(|a| a.label.as_str()).collect();
        assert!(labels.contains(&"Skanuj porty 192.168.1.1"), "{labels:?}");
        // no repeated ping of the target just pinged
        assert!(!labels.iter().any(|l| l.starts_with("Ping ")));
    }

    #[test]
    fn port_scan_with_ssh_and_http_ports() {
        let actions = resolve(
            IntentKind::NetworkPortScan,
            &with_ip("10.0.0.5"),
            "otwarte porty: 22, 80, 443",
        );
        assert!(actions.iter().any(|a| a.id == "ssh:10.0.0.5"));
        assert!(actions.iter().any(|a| a.id == "browse:10.0.0.5"));
        assert!(actions.iter().any(|a| a.id == "monitor:10.0.0.5"));
    }

    #[test]
    fn camera_message_gets_preview_and_monitor() {
        let actions = resolve(
            IntentKind::CameraDescribe,
            &with_ip("192.168.1.100"),
            "kamera pokazuje pusty korytarz",
        );
        assert!(actions.iter().any(|a| a.id == "camera-live:192.168.1.100"));
        assert!(actions.iter().any(|a| a.id == "monitor:192.168.1.100"));
    }

    #[test]
    fn welcome_gets_canned_starters() {
        let actions = resolve(IntentKind::ChatFallback, &Entities::default(), "cześć");
        assert!(actions.iter().any(|a| a.id == "starter-scan"));
    }

    #[test]
    fn never_more_than_five_and_no_duplicate_ids() {
        let mut entities = with_ip("10.1.1.1");
        entities.subnet = Some("10.1.1.0/24".into());
        let actions = resolve(
            IntentKind::NetworkScan,
            &entities,
            "znaleziono kamera 10.1.1.1 porty 22 80",
        );
        assert!(actions.len() <= 5);
        let mut ids: Vec<_> = actions.iter().map(|a| a.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), actions.len());
    }
}
