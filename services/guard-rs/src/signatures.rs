//! Scanner user-agent and request-body attack signatures.

use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};

/// User agents of vulnerability scanners and exploitation frameworks.
static SCANNER_AGENTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)\b(",
        r"sqlmap|nikto|nmap|masscan|zmap|zgrab|gobuster|dirbuster|dirb|wfuzz|ffuf|feroxbuster",
        r"|nuclei|wpscan|joomscan|acunetix|nessus|openvas|w3af|skipfish|arachni|netsparker",
        r"|metasploit|meterpreter|hydra|medusa|havij|jorgee|zmeu|morfeus|commix|xsstrike",
        r"|whatweb|httprint|owasp[ _-]?zap|burp ?(suite|collaborator)|qualys|l9explore|leakix",
        r")\b"
    ))
    .expect("scanner pattern is valid")
});

pub fn is_scanner_agent(user_agent: &str) -> bool {
    SCANNER_AGENTS.is_match(user_agent)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionKind {
    Sql,
    Xss,
    Command,
    Traversal,
}

impl InjectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InjectionKind::Sql => "sql injection",
            InjectionKind::Xss => "cross-site scripting",
            InjectionKind::Command => "command injection",
            InjectionKind::Traversal => "path traversal",
        }
    }
}

const INJECTION_KINDS: &[InjectionKind] = &[
    InjectionKind::Sql,
    InjectionKind::Xss,
    InjectionKind::Command,
    InjectionKind::Traversal,
];

static INJECTION_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)(\bunion\b[\s/*+]+(all[\s/*+]+)?select\b|'\s*or\s+'?\d+'?\s*=\s*'?\d+|\bor\s+1\s*=\s*1\b|;\s*drop\s+table\b|\binformation_schema\b|\bsleep\s*\(\s*\d+\s*\)|\bwaitfor\s+delay\b|@@version|\bload_file\s*\(|\binto\s+(out|dump)file\b)",
        r"(?i)(<\s*script\b|javascript\s*:|\bon(error|load|mouseover|focus)\s*=|<\s*iframe\b|<\s*svg[^>]*\bonload\b|document\.cookie)",
        r"(?i)(;\s*(cat|wget|curl|nc|bash|sh|id|whoami|uname)\b|\|\s*(nc|bash|sh)\b|\|\s*cat\s+/|(\$\(|`)\s*(cat|wget|curl|nc|ncat|bash|sh|id|whoami|uname|ls|rm|ping|nslookup|python3?|perl|php)\b|\b(shell_exec|passthru|proc_open|popen)\s*\(|/bin/(ba)?sh\b|cmd\.exe|powershell\s+-)",
        r"(?i)((\.\./){2,}|(\.\.\\){2,}|%2e%2e(%2f|%5c)|\.\./+(etc|proc|windows|\.env|\.git|\.ssh)\b|/etc/(passwd|shadow)|c:\\windows\\system32)",
    ])
    .expect("injection patterns are valid")
});

/// First matching attack family in a request body, if any.
pub fn detect_injection(body: &str) -> Option<InjectionKind> {
    INJECTION_PATTERNS
        .matches(body)
        .iter()
        .next()
        .map(|index| INJECTION_KINDS[index])
}
