//! Recovering run names and scan numbers from free-text `TITLE=` lines.
//!
//! Producers of peak lists never agreed on how to encode where a spectrum came
//! from, so the title is tried against a list of known dialects in priority
//! order. The first dialect whose run and scan patterns both match wins.
use std::sync::LazyLock;

use log::warn;
use regex::Regex;

use crate::config::UserTitlePattern;
use crate::io::leaf::value_after;

struct TitleDialect {
    name: &'static str,
    run: Regex,
    scan: Regex,
    charge: Option<Regex>,
    retention: Option<Regex>,
}

impl TitleDialect {
    fn new(name: &'static str, run: &str, scan: &str) -> Self {
        Self {
            name,
            run: Regex::new(run).unwrap(),
            scan: Regex::new(scan).unwrap(),
            charge: None,
            retention: None,
        }
    }

    fn with_charge(mut self, charge: &str) -> Self {
        self.charge = Some(Regex::new(charge).unwrap());
        self
    }

    fn with_retention(mut self, retention: &str) -> Self {
        self.retention = Some(Regex::new(retention).unwrap());
        self
    }
}

static TITLE_DIALECTS: LazyLock<Vec<TitleDialect>> = LazyLock::new(|| {
    vec![
        TitleDialect::new(
            "maxquant",
            r"^TITLE=\s*RawFile:\s*(.+)\s+FinneganScanNumber:\s+[0-9]+(?:\s+_sil_)?$",
            r"^TITLE=\s*RawFile:\s*.+\s+FinneganScanNumber:\s+([0-9]+)(?:\s+.*)?$",
        ),
        TitleDialect::new(
            "mascot",
            r"^TITLE=[0-9]+: (?:Scan|Sum of [0-9]+ scans in range) [0-9]+ \(rt=[0-9.]+\) .*\[(?:.*[/\\])?([^/\\]*)\]$",
            r"^TITLE=[0-9]+: (?:Scan|Sum of [0-9]+ scans in range) ([0-9]+) \(rt=[0-9.]+\) .*$",
        )
        .with_retention(r"^TITLE=[0-9]+: (?:Scan|Sum of [0-9]+ scans in range) [0-9]+ \(rt=([0-9.]+)\) .*$"),
        TitleDialect::new(
            "qexactive",
            r"^TITLE=\s*(.+)\s+Spectrum[0-9]+\s*scans: [0-9]+(?:\s+.*)?$",
            r"^TITLE=\s*.+\s+Spectrum[0-9]+\s*scans: ([0-9]+)(?:\s+.*)?$",
        ),
        TitleDialect::new(
            "massmatrix",
            r"^TITLE=File:(.*[0-9A-Za-z])\s*Scans:[0-9]+\s*RT:.+\s*Charge:[0-9]+[+].+$",
            r"^TITLE=File:.*[0-9A-Za-z]\s*Scans:([0-9]+)\s*RT:.+\s*Charge:[0-9]+[+].+$",
        )
        .with_charge(r"^TITLE=File:.*[0-9A-Za-z]\s*Scans:[0-9]+\s*RT:.+\s*Charge:([0-9]+)[+].+$"),
        TitleDialect::new(
            "msconvert",
            r"^TITLE=(.*)\.[0-9]+\.[0-9]+\.(?:[0-9]+)?(?:\s.*)?$",
            r"^TITLE=.*\.([0-9]+)\.[0-9]+\.(?:[0-9]+)?(?:\s.*)?$",
        )
        .with_charge(r"^TITLE=.*\.[0-9]+\.[0-9]+\.([0-9]+)?(?:\s.*)?$"),
        TitleDialect::new(
            "openms",
            r"^TITLE=.*\s(?:scan|index)=[0-9]+_(.*)$",
            r"^TITLE=.*\s(?:scan|index)=([0-9]+)_.*$",
        ),
        // Take the first token as the run and the first long number as the scan
        TitleDialect::new(
            "generic",
            r"^TITLE=([^\s.]*).*$",
            r"^TITLE=[^\s.]*(?:[0-9]{0,2}[^0-9]+)*([0-9]{3,10}).*$",
        ),
    ]
});

static ELUTION_SPLIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\s*to\s*").unwrap());

/// What could be recovered from a title line
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct TitleInfo {
    pub run: Option<String>,
    pub scan: Option<u64>,
    pub charge: Option<i32>,
    pub precursor_intensity: Option<f64>,
    pub elution_start: Option<f64>,
    pub elution_end: Option<f64>,
    /// The name of the dialect that matched, if any
    pub dialect: Option<&'static str>,
}

fn first_group<'a>(pattern: &Regex, text: &'a str) -> Option<&'a str> {
    pattern
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Parses title lines for one source, remembering whether it already complained
#[derive(Debug, Default)]
pub(crate) struct TitleParser {
    user: Option<UserTitlePattern>,
    warned: bool,
}

impl TitleParser {
    pub(crate) fn new(user: Option<UserTitlePattern>) -> Self {
        Self {
            user,
            warned: false,
        }
    }

    /// Parse a full `TITLE=...` line
    pub(crate) fn parse(&mut self, line: &str, source: &str, line_number: u64) -> TitleInfo {
        let mut info = TitleInfo::default();
        let mut failed_user_pattern = None;

        if let Some(user) = &self.user {
            match first_group(&user.run, line) {
                Some(run) => match first_group(&user.scan, line).and_then(|s| s.parse().ok()) {
                    Some(scan) => {
                        info.run = Some(run.to_string());
                        info.scan = Some(scan);
                        info.dialect = Some("user");
                        return info;
                    }
                    None => failed_user_pattern = Some("SCAN_RE"),
                },
                None => failed_user_pattern = Some("RUN_RE"),
            }
        }

        for dialect in TITLE_DIALECTS.iter() {
            let Some(run) = first_group(&dialect.run, line) else {
                continue;
            };
            let Some(scan) = first_group(&dialect.scan, line).and_then(|s| s.parse().ok()) else {
                continue;
            };
            info.run = Some(run.to_string());
            info.scan = Some(scan);
            info.dialect = Some(dialect.name);
            if let Some(pattern) = &dialect.charge {
                info.charge = first_group(pattern, line).and_then(|z| z.parse().ok());
            }
            if let Some(pattern) = &dialect.retention {
                info.elution_start = first_group(pattern, line).and_then(|t| t.parse().ok());
            }
            return info;
        }

        self.parse_key_values(line, &mut info);

        if (info.run.is_none() || info.scan.is_none()) && !self.warned {
            self.warned = true;
            let mut message = format!(
                "Can't parse TITLE tag {line:?} from {source} at line {line_number}, run name or scan number will be missing"
            );
            if let Some(key) = failed_user_pattern {
                message.push_str(&format!(" ({key} did not match)"));
            }
            warn!("{message}");
        }
        info
    }

    fn parse_key_values(&self, line: &str, info: &mut TitleInfo) {
        let text = line.trim();
        let text = text.strip_prefix("TITLE=").unwrap_or(text);

        info.scan = value_after(text, " finneganscannumber:")
            .and_then(|v| v.split_whitespace().next().and_then(|s| s.parse().ok()));

        info.run = value_after(text, "rawfile:").or_else(|| value_after(text, "period:"));

        info.precursor_intensity =
            value_after(text, "precintensity:").and_then(|v| v.split_whitespace().next()?.parse().ok());

        if let Some(elution) = value_after(text, "elution from:") {
            let mut parts = ELUTION_SPLIT.split(&elution);
            info.elution_start = parts.next().and_then(|v| v.trim().parse().ok());
            info.elution_end = parts.next().and_then(|v| v.trim().parse().ok());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use regex::RegexBuilder;

    fn parse(line: &str) -> TitleInfo {
        TitleParser::default().parse(line, "test", 1)
    }

    #[test]
    fn test_dialects() {
        let info = parse("TITLE=RawFile: m090623_03.raw FinneganScanNumber: 2995");
        assert_eq!(info.dialect, Some("maxquant"));
        assert_eq!(info.run.as_deref(), Some("m090623_03.raw"));
        assert_eq!(info.scan, Some(2995));

        let info = parse("TITLE=12: Scan 4711 (rt=21.5) [C:\\data\\run_01.raw]");
        assert_eq!(info.dialect, Some("mascot"));
        assert_eq!(info.run.as_deref(), Some("run_01.raw"));
        assert_eq!(info.scan, Some(4711));
        assert_eq!(info.elution_start, Some(21.5));

        let info = parse("TITLE=run_qe Spectrum12 scans: 3456");
        assert_eq!(info.dialect, Some("qexactive"));
        assert_eq!(info.run.as_deref(), Some("run_qe"));
        assert_eq!(info.scan, Some(3456));

        let info =
            parse("TITLE=File:XLMS001_1DG001L1_01_02.mzXML Scans:13 RT:0.2867min Charge:2+ Fragmentation:cid");
        assert_eq!(info.dialect, Some("massmatrix"));
        assert_eq!(info.run.as_deref(), Some("XLMS001_1DG001L1_01_02.mzXML"));
        assert_eq!(info.scan, Some(13));
        assert_eq!(info.charge, Some(2));

        let info = parse("TITLE=foo.1.1.2");
        assert_eq!(info.dialect, Some("msconvert"));
        assert_eq!(info.run.as_deref(), Some("foo"));
        assert_eq!(info.scan, Some(1));
        assert_eq!(info.charge, Some(2));

        let info = parse("TITLE=sample.2048.2048. File:\"sample.raw\"");
        assert_eq!(info.dialect, Some("msconvert"));
        assert_eq!(info.scan, Some(2048));
        assert_eq!(info.charge, None);

        let info = parse("TITLE=spectrum 7 scan=1234_myrun");
        assert_eq!(info.dialect, Some("openms"));
        assert_eq!(info.run.as_deref(), Some("myrun"));
        assert_eq!(info.scan, Some(1234));

        let info = parse("TITLE=myrun scan number 12345");
        assert_eq!(info.dialect, Some("generic"));
        assert_eq!(info.run.as_deref(), Some("myrun"));
        assert_eq!(info.scan, Some(12345));
    }

    #[test]
    fn test_key_values() {
        let info = parse(
            "TITLE=Elution from: 10.5 to 12.25 period: run_b experiment: 1 precIntensity: 50.5",
        );
        assert_eq!(info.dialect, None);
        assert_eq!(info.run.as_deref(), Some("run_b"));
        assert_eq!(info.scan, None);
        assert_eq!(info.elution_start, Some(10.5));
        assert_eq!(info.elution_end, Some(12.25));
        assert_eq!(info.precursor_intensity, Some(50.5));
    }

    #[test_log::test]
    fn test_unparseable() {
        let mut parser = TitleParser::default();
        let info = parser.parse("TITLE=nothing", "test", 3);
        assert!(info.scan.is_none());
        assert!(parser.warned);
    }

    #[test]
    fn test_user_pattern_first() {
        let user = UserTitlePattern {
            run: RegexBuilder::new(r"^(?:TITLE=run:(\w+).*)$")
                .case_insensitive(true)
                .build()
                .unwrap(),
            scan: RegexBuilder::new(r"^(?:TITLE=.*\bs(\d+))$")
                .case_insensitive(true)
                .build()
                .unwrap(),
        };
        let mut parser = TitleParser::new(Some(user));
        let info = parser.parse("TITLE=RUN:abc.1.1.2 s77", "test", 1);
        assert_eq!(info.dialect, Some("user"));
        assert_eq!(info.run.as_deref(), Some("abc"));
        assert_eq!(info.scan, Some(77));

        let info = parser.parse("TITLE=foo.1.1.2", "test", 2);
        assert_eq!(info.dialect, Some("msconvert"));
    }
}
