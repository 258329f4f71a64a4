/*!
Normalization of device exports before diffing.

Devices embed values in their exports that change on every export without
any logical configuration change: revision counters, the exporting admin,
re-salted encrypted secrets, clock-derived stamps. These are masked or
dropped so that two exports of the same configuration compare equal.
*/

use once_cell::sync::Lazy;
use regex::Regex;

use crate::device::DeviceKind;

fn regex(pattern: &str) -> Regex {
    Regex::new(pattern).expect("normalization pattern is valid")
}

static CONF_FILE_VER: Lazy<Regex> = Lazy::new(|| regex(r"^#conf_file_ver=\d+\s*$"));
static CONFIG_VERSION_USER: Lazy<Regex> = Lazy::new(|| regex(r":user=[^:\s]*"));
static ENCRYPTED_SECRET: Lazy<Regex> = Lazy::new(|| regex(r"ENC \S+"));
static ISO_TIMESTAMP: Lazy<Regex> =
    Lazy::new(|| regex(r"\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:?\d{2})?"));
static EPOCH_STAMP: Lazy<Regex> =
    Lazy::new(|| regex(r#"(set (?:last-?update|timestamp|uptime)\S*) "?\d+"?"#));
static LAST_CHANGE: Lazy<Regex> =
    Lazy::new(|| regex(r"^!\s*(Last configuration change|NVRAM config last updated)"));
static CURRENT_CONFIG_SIZE: Lazy<Regex> =
    Lazy::new(|| regex(r"^(Current configuration|Building configuration)"));
static NTP_CLOCK_PERIOD: Lazy<Regex> = Lazy::new(|| regex(r"^ntp clock-period \d+"));

enum Rule {
    Drop(&'static Lazy<Regex>),
    Replace(&'static Lazy<Regex>, &'static str),
}

static FORTIGATE_RULES: &[Rule] = &[
    Rule::Drop(&CONF_FILE_VER),
    Rule::Replace(&CONFIG_VERSION_USER, ""),
    Rule::Replace(&ENCRYPTED_SECRET, "ENC <masked>"),
    Rule::Replace(&EPOCH_STAMP, "$1 <stamp>"),
    Rule::Replace(&ISO_TIMESTAMP, "<timestamp>"),
];

static GENERIC_RULES: &[Rule] = &[
    Rule::Drop(&LAST_CHANGE),
    Rule::Drop(&CURRENT_CONFIG_SIZE),
    Rule::Drop(&NTP_CLOCK_PERIOD),
    Rule::Replace(&ISO_TIMESTAMP, "<timestamp>"),
];

/// Masks volatile fields of one export format
pub struct Normalizer {
    rules: &'static [Rule],
}

impl Normalizer {
    pub fn for_kind(kind: DeviceKind) -> Self {
        let rules = match kind {
            DeviceKind::Fortigate => FORTIGATE_RULES,
            DeviceKind::Generic => GENERIC_RULES,
        };
        Self { rules }
    }

    /// Normalized text, one logical line per line, `\n` terminated
    pub fn normalize(&self, content: &str) -> String {
        let mut lines: Vec<String> = Vec::new();
        'lines: for raw in content.lines() {
            let mut line = raw.trim_end().to_string();
            for rule in self.rules {
                match rule {
                    Rule::Drop(re) if re.is_match(&line) => continue 'lines,
                    Rule::Drop(_) => {}
                    Rule::Replace(re, with) => {
                        if re.is_match(&line) {
                            line = re.replace_all(&line, *with).into_owned();
                        }
                    }
                }
            }
            lines.push(line);
        }
        while lines.last().map_or(false, |l| l.is_empty()) {
            lines.pop();
        }

        let mut normalized = lines.join("\n");
        if !normalized.is_empty() {
            normalized.push('\n');
        }
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fortigate_revision_counters_ignored() {
        let normalizer = Normalizer::for_kind(DeviceKind::Fortigate);
        let a = "#config-version=FGT60F-7.2.5-FW-build1517-230606:opmode=0:vdom=0:user=admin\n#conf_file_ver=1111\nconfig system global\n    set hostname \"fw-01\"\nend\n";
        let b = "#config-version=FGT60F-7.2.5-FW-build1517-230606:opmode=0:vdom=0:user=backup\n#conf_file_ver=2222\nconfig system global\n    set hostname \"fw-01\"\nend\n";
        assert_eq!(normalizer.normalize(a), normalizer.normalize(b));
    }

    #[test]
    fn test_encrypted_secrets_masked() {
        let normalizer = Normalizer::for_kind(DeviceKind::Fortigate);
        let a = "config system admin\n    edit \"admin\"\n        set password ENC SH2abc==\n    next\nend\n";
        let b = "config system admin\n    edit \"admin\"\n        set password ENC SH2xyz==\n    next\nend\n";
        let normalized = normalizer.normalize(a);
        assert_eq!(normalized, normalizer.normalize(b));
        assert!(normalized.contains("ENC <masked>"));
    }

    #[test]
    fn test_line_endings_and_trailing_space() {
        let normalizer = Normalizer::for_kind(DeviceKind::Fortigate);
        let crlf = "config system dns\r\n    set primary 1.1.1.1   \r\nend\r\n\r\n\r\n";
        assert_eq!(
            normalizer.normalize(crlf),
            "config system dns\n    set primary 1.1.1.1\nend\n"
        );
    }

    #[test]
    fn test_real_change_survives() {
        let normalizer = Normalizer::for_kind(DeviceKind::Fortigate);
        let a = "config system dns\n    set primary 1.1.1.1\nend\n";
        let b = "config system dns\n    set primary 8.8.8.8\nend\n";
        assert_ne!(normalizer.normalize(a), normalizer.normalize(b));
    }

    #[test]
    fn test_generic_drops_change_banners() {
        let normalizer = Normalizer::for_kind(DeviceKind::Generic);
        let a = "Building configuration...\n! Last configuration change at 10:00:01 UTC Mon Mar 4 2024\nhostname edge\nntp clock-period 17208233\n";
        let b = "Building configuration...\n! Last configuration change at 11:30:00 UTC Tue Mar 5 2024\nhostname edge\nntp clock-period 17208100\n";
        assert_eq!(normalizer.normalize(a), "hostname edge\n");
        assert_eq!(normalizer.normalize(a), normalizer.normalize(b));
    }

    #[test]
    fn test_timestamps_masked() {
        let normalizer = Normalizer::for_kind(DeviceKind::Generic);
        assert_eq!(
            normalizer.normalize("# exported 2024-03-04T10:00:01Z\n"),
            "# exported <timestamp>\n"
        );
        assert_eq!(normalizer.normalize(""), "");
    }
}
