//! Device filter rules.
//!
//! A rule is a 5-tuple `(class, vendor, product, version, allow)` where `-1`
//! wildcards a field. The string form joins the five tokens with a token
//! separator and rules with a rule separator; both separators are caller
//! chosen and must be non-empty.

use std::fmt;

use memchr::memmem;

pub const DEFAULT_TOKEN_SEP: &str = ",";
pub const DEFAULT_RULE_SEP: &str = "|";

const HID_CLASS: i32 = 0x03;

#[derive(Debug, PartialEq, Eq)]
pub enum FilterError {
    EmptySeparator,
    BadToken(String),
    BadRuleLength(usize),
    OutOfRange(&'static str),
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::EmptySeparator => write!(f, "separator strings must be non-empty"),
            FilterError::BadToken(tok) => write!(f, "cannot parse filter token '{tok}'"),
            FilterError::BadRuleLength(n) => {
                write!(f, "filter rule has {n} tokens, expected 5")
            }
            FilterError::OutOfRange(field) => write!(f, "filter rule field {field} out of range"),
        }
    }
}

impl std::error::Error for FilterError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterRule {
    pub device_class: i32,
    pub vendor_id: i32,
    pub product_id: i32,
    pub device_version_bcd: i32,
    pub allow: bool,
}

/// Class triple of one interface, as found in its descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterfaceClass {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CheckOptions {
    /// Also match non-boot HID interfaces on multi-interface devices.
    pub dont_skip_non_boot_hid: bool,
    /// Decision when no rule matches.
    pub default_allow: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterRules {
    rules: Vec<FilterRule>,
}

fn parse_token(tok: &str) -> Result<i32, FilterError> {
    let bad = || FilterError::BadToken(tok.to_owned());
    if let Some(hex) = tok.strip_prefix("0x").or_else(|| tok.strip_prefix("0X")) {
        i32::from_str_radix(hex, 16).map_err(|_| bad())
    } else {
        tok.parse::<i32>().map_err(|_| bad())
    }
}

fn split<'a>(s: &'a str, sep: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut start = 0;
    for pos in memmem::find_iter(s.as_bytes(), sep.as_bytes()) {
        if pos >= start {
            parts.push(&s[start..pos]);
            start = pos + sep.len();
        }
    }
    parts.push(&s[start..]);
    parts
}

impl FilterRules {
    /// Compile a rule string. Leading, trailing and consecutive rule
    /// separators are ignored; every surviving rule must verify.
    pub fn parse(s: &str, token_sep: &str, rule_sep: &str) -> Result<FilterRules, FilterError> {
        if token_sep.is_empty() || rule_sep.is_empty() {
            return Err(FilterError::EmptySeparator);
        }
        let mut rules = Vec::new();
        for rule_str in split(s, rule_sep) {
            if rule_str.is_empty() {
                continue;
            }
            let tokens = split(rule_str, token_sep);
            if tokens.len() != 5 {
                return Err(FilterError::BadRuleLength(tokens.len()));
            }
            let allow = match parse_token(tokens[4])? {
                0 => false,
                1 => true,
                _ => return Err(FilterError::OutOfRange("allow")),
            };
            rules.push(FilterRule {
                device_class: parse_token(tokens[0])?,
                vendor_id: parse_token(tokens[1])?,
                product_id: parse_token(tokens[2])?,
                device_version_bcd: parse_token(tokens[3])?,
                allow,
            });
        }
        let rules = FilterRules { rules };
        rules.verify()?;
        Ok(rules)
    }

    pub fn from_rules(rules: Vec<FilterRule>) -> FilterRules {
        FilterRules { rules }
    }

    /// Range-check every rule.
    pub fn verify(&self) -> Result<(), FilterError> {
        for rule in &self.rules {
            if !(-1..=255).contains(&rule.device_class) {
                return Err(FilterError::OutOfRange("class"));
            }
            if !(-1..=65535).contains(&rule.vendor_id) {
                return Err(FilterError::OutOfRange("vendor"));
            }
            if !(-1..=65535).contains(&rule.product_id) {
                return Err(FilterError::OutOfRange("product"));
            }
            if !(-1..=65535).contains(&rule.device_version_bcd) {
                return Err(FilterError::OutOfRange("version"));
            }
        }
        Ok(())
    }

    /// Canonical string form: decimal tokens, single separators.
    pub fn to_string_with(&self, token_sep: &str, rule_sep: &str) -> String {
        self.rules
            .iter()
            .map(|r| {
                format!(
                    "{}{sep}{}{sep}{}{sep}{}{sep}{}",
                    r.device_class,
                    r.vendor_id,
                    r.product_id,
                    r.device_version_bcd,
                    r.allow as u8,
                    sep = token_sep
                )
            })
            .collect::<Vec<_>>()
            .join(rule_sep)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    /// Match a device against the rules; the first matching rule decides.
    ///
    /// The class field is tested against the device class (except for 0x00
    /// "see per-interface" and 0xef "miscellaneous") and against each
    /// interface class. Non-boot HID interfaces on multi-interface devices
    /// are skipped unless overridden; when every interface would be skipped
    /// the override is forced so the check cannot pass vacuously.
    pub fn check(
        &self,
        device_class: u8,
        vendor_id: u16,
        product_id: u16,
        device_version_bcd: u16,
        interfaces: &[InterfaceClass],
        opts: CheckOptions,
    ) -> bool {
        let multi = interfaces.len() > 1;
        let skippable = |i: &InterfaceClass| {
            multi && i.class as i32 == HID_CLASS && i.subclass == 0 && i.protocol == 0
        };

        let mut dont_skip = opts.dont_skip_non_boot_hid;
        if !dont_skip && !interfaces.is_empty() && interfaces.iter().all(skippable) {
            dont_skip = true;
        }

        let device_class_testable = device_class != 0x00 && device_class != 0xef;
        for rule in &self.rules {
            if rule.vendor_id != -1 && rule.vendor_id != vendor_id as i32 {
                continue;
            }
            if rule.product_id != -1 && rule.product_id != product_id as i32 {
                continue;
            }
            if rule.device_version_bcd != -1
                && rule.device_version_bcd != device_version_bcd as i32
            {
                continue;
            }
            let class_match = rule.device_class == -1
                || (device_class_testable && rule.device_class == device_class as i32)
                || interfaces
                    .iter()
                    .any(|i| (dont_skip || !skippable(i)) && rule.device_class == i.class as i32);
            if class_match {
                return rule.allow;
            }
        }
        opts.default_allow
    }
}

impl fmt::Display for FilterRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_with(DEFAULT_TOKEN_SEP, DEFAULT_RULE_SEP))
    }
}
