//! Marker detection over violation messages
//!
//! All markers are found in one Aho-Corasick pass. Matching is case
//! sensitive and overlapping, so `nvpol.` also reports `vpol.`.

use aho_corasick::AhoCorasick;
use std::sync::OnceLock;
use tracing::warn;

/// Substrings the detectors and extractors key on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Kyverno,
    BlockedDueToPolicies,
    ValidatingPolicy,
    NamespacedValidatingPolicy,
    ImageValidatingPolicy,
    ValidatingAdmissionPolicy,
    AdmissionWebhook,
    DeniedTheRequest,
    DeniedRequest,
}

const MARKERS: [(Marker, &str); 9] = [
    (Marker::Kyverno, "kyverno"),
    (Marker::BlockedDueToPolicies, "blocked due to the following policies"),
    (Marker::ValidatingPolicy, "vpol."),
    (Marker::NamespacedValidatingPolicy, "nvpol."),
    (Marker::ImageValidatingPolicy, "ivpol."),
    (Marker::ValidatingAdmissionPolicy, "ValidatingAdmissionPolicy"),
    (Marker::AdmissionWebhook, "admission webhook"),
    (Marker::DeniedTheRequest, "denied the request:"),
    (Marker::DeniedRequest, "denied request:"),
];

impl Marker {
    fn bit(self) -> u16 {
        1 << (self as u16)
    }

    pub fn text(self) -> &'static str {
        MARKERS[self as usize].1
    }
}

fn matcher() -> Option<&'static AhoCorasick> {
    static MATCHER: OnceLock<Option<AhoCorasick>> = OnceLock::new();
    MATCHER
        .get_or_init(|| {
            AhoCorasick::new(MARKERS.iter().map(|(_, pattern)| *pattern))
                .map_err(|e| warn!("Failed to build marker matcher, using substring scan: {}", e))
                .ok()
        })
        .as_ref()
}

/// Set of markers present in a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkerSet(u16);

impl MarkerSet {
    /// Scan `text` for every known marker
    pub fn scan(text: &str) -> Self {
        let mut bits = 0u16;
        match matcher() {
            Some(ac) => {
                for m in ac.find_overlapping_iter(text) {
                    bits |= MARKERS[m.pattern().as_usize()].0.bit();
                }
            }
            None => {
                for (marker, pattern) in MARKERS {
                    if text.contains(pattern) {
                        bits |= marker.bit();
                    }
                }
            }
        }
        Self(bits)
    }

    pub fn has(&self, marker: Marker) -> bool {
        self.0 & marker.bit() != 0
    }

    pub fn has_all(&self, markers: &[Marker]) -> bool {
        markers.iter().all(|m| self.has(*m))
    }
}
