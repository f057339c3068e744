use std::sync::LazyLock;

use regex::Regex;

/// One catalogue entry: a stable tag plus the pattern that triggers it.
struct DangerPattern {
    tag: &'static str,
    regex: Regex,
}

fn pattern(tag: &'static str, re: &str) -> DangerPattern {
    DangerPattern {
        tag,
        regex: Regex::new(re).expect("static pattern must compile"),
    }
}

static CATALOGUE: LazyLock<Vec<DangerPattern>> = LazyLock::new(|| {
    vec![
        // Destructive deletes anchored at or near the filesystem root.
        pattern(
            "destructive_root_delete",
            r"\brm\s+(-\w+\s+)*-\w*[rf]\w*\s+(-\w+\s+)*(/|/\*|/[a-z]+\s*$|--no-preserve-root)",
        ),
        pattern("destructive_root_delete", r"\bfind\s+/\s+.*-delete\b"),
        // Raw writes to block devices.
        pattern("block_device_write", r"\bdd\b.*\bof=/dev/(sd|hd|vd|nvme|mmcblk)"),
        pattern("block_device_write", r">\s*/dev/(sd|hd|vd|nvme|mmcblk)"),
        pattern("block_device_write", r"\bshred\b.*\s/dev/"),
        // Filesystem creation wipes whatever lives on the target.
        pattern("filesystem_creation", r"\bmkfs(\.\w+)?\b"),
        // Piping a network fetch straight into a shell.
        pattern("pipe_to_shell", r"\b(curl|wget|fetch)\b[^|;]*\|\s*(sudo\s+)?(ba|z|fi|da)?sh\b"),
        // Privilege escalation.
        pattern("privilege_escalation", r"^\s*(sudo|doas)\b"),
        pattern("privilege_escalation", r"\bsu\s+(-\s*)?(root)?\s*$"),
        pattern("privilege_escalation", r"\bchmod\s+(u\+s|[0-7]*4[0-7]{3})\b"),
        // Writes into system configuration directories.
        pattern("system_config_write", r">{1,2}\s*/etc/"),
        pattern("system_config_write", r"\btee\b\s+(-a\s+)?/etc/"),
        pattern("system_config_write", r"\b(cp|mv|install)\b[^|;]*\s/etc/"),
        // Reads of secret material.
        pattern("secret_file_read", r"/etc/shadow\b"),
        pattern("secret_file_read", r"\.ssh/id_[a-z0-9]+"),
        pattern("secret_file_read", r"\.aws/credentials"),
        pattern("secret_file_read", r"\.gnupg/"),
        // Reverse-shell constructs.
        pattern("reverse_shell", r"\bnc\b[^|;]*\s-\w*e\b"),
        pattern("reverse_shell", r"/dev/tcp/"),
        pattern("reverse_shell", r"\bbash\s+-i\b.*>&"),
        pattern("reverse_shell", r"\bmkfifo\b.*\bnc\b"),
        // Init-level process and system control.
        pattern(
            "system_control",
            r"\b(shutdown|reboot|halt|poweroff)\b|\binit\s+0\b",
        ),
        pattern("system_control", r"\bsystemctl\s+(halt|poweroff|reboot|emergency)\b"),
        pattern("system_control", r"\bkill\s+(-9\s+|-KILL\s+)?1\s*$"),
    ]
});

/// Scan a command against the dangerous-pattern catalogue. Returns the list
/// of matched tags, deduplicated, in catalogue order. The scanner never
/// blocks on its own; the safety evaluator decides whether a match is
/// advisory or authoritative.
pub fn scan(command: &str) -> Vec<&'static str> {
    let mut tags = Vec::new();
    for entry in CATALOGUE.iter() {
        if entry.regex.is_match(command) && !tags.contains(&entry.tag) {
            tags.push(entry.tag);
        }
    }
    tags
}
