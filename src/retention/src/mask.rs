//! Filename masks.
//!
//! A mask is a template such as `tiff/prec_%YYYY%MM%DD.tif` that both names
//! dated files and parses the date back out of them. Tokens:
//!
//! | token   | capture        | pattern                      |
//! |---------|----------------|------------------------------|
//! | `%YYYY` | `YEAR`         | `[0-9]{4}`                   |
//! | `%YY`   | `YEAR2DIGITS`  | `[0-9]{2}`                   |
//! | `%MM`   | `MONTH`        | `0[1-9]\|1[012]`             |
//! | `%DD`   | `DAY`          | `0[1-9]\|[12][0-9]\|3[01]`   |
//! | `%JJJ`  | `JULIAN_DAY`   | `\d{3}`                      |
//! | `%hh`   | `HOUR`         | `[0-1][0-9]\|2[0-4]`         |
//! | `%mm`   | `MINUTES`      | `[0-5][0-9]`                 |
//! | `%ss`   | `SECONDS`      | `[0-5][0-9]`                 |
//! | `*`     |                | `.*`                         |
//!
//! Text between `%(` and `%)` is a user regex passed through as a group.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;

use crate::error::{RetentionError, Result};

/// Optional compression extension accepted after every mask.
pub const COMPRESSION_SUFFIX: &str = r"(\.(gz|zip|rar|7z|tar))?$";

const GROUP_OPEN: &str = "%(";
const GROUP_CLOSE: &str = "%)";

/// Token, regex fragment, strftime equivalent. Longer tokens first.
const TOKENS: [(&str, &str, &str); 8] = [
    ("%YYYY", "(?P<YEAR>[0-9]{4})", "%Y"),
    ("%YY", "(?P<YEAR2DIGITS>[0-9]{2})", "%y"),
    ("%MM", "(?P<MONTH>0[1-9]|1[012])", "%m"),
    ("%DD", "(?P<DAY>0[1-9]|[12][0-9]|3[01])", "%d"),
    ("%JJJ", r"(?P<JULIAN_DAY>\d{3})", "%j"),
    ("%hh", "(?P<HOUR>[0-1][0-9]|2[0-4])", "%H"),
    ("%mm", "(?P<MINUTES>[0-5][0-9])", "%M"),
    ("%ss", "(?P<SECONDS>[0-5][0-9])", "%S"),
];

/// Fallback archive suffix when a mask has no usable date tokens.
const DEFAULT_DATE_FORMAT: &str = "%Y%m%d%H%M%S";

/// A compiled mask.
#[derive(Debug, Clone)]
pub struct MaskPattern {
    mask: String,
    regex: Regex,
}

impl MaskPattern {
    pub fn compile(mask: &str) -> Result<Self> {
        let pattern = mask_to_regex(mask);
        let regex = Regex::new(&pattern).map_err(|e| RetentionError::InvalidMask {
            mask: mask.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            mask: mask.to_string(),
            regex,
        })
    }

    pub fn mask(&self) -> &str {
        &self.mask
    }

    pub fn regex(&self) -> &Regex {
        &self.regex
    }

    pub fn is_match(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    /// Timestamp embedded in `name`, if it matches and carries a year.
    ///
    /// Two-digit years are placed in a century relative to
    /// `reference_year`. A julian day stands in for month and day when the
    /// mask has no month. Missing time fields are zero.
    pub fn timestamp(&self, name: &str, reference_year: i32) -> Option<NaiveDateTime> {
        let caps = self.regex.captures(name)?;
        let number = |group: &str| -> Option<u32> {
            caps.name(group).and_then(|m| m.as_str().parse().ok())
        };

        let year = match (caps.name("YEAR"), number("YEAR2DIGITS")) {
            (Some(year), _) => year.as_str().parse().ok()?,
            (None, Some(two_digits)) => resolve_century(two_digits as i32, reference_year),
            (None, None) => return None,
        };

        let date = match (number("MONTH"), number("JULIAN_DAY")) {
            (Some(month), _) => NaiveDate::from_ymd_opt(year, month, number("DAY").unwrap_or(1))?,
            (None, Some(ordinal)) => NaiveDate::from_yo_opt(year, ordinal)?,
            (None, None) => NaiveDate::from_ymd_opt(year, 1, number("DAY").unwrap_or(1))?,
        };

        let time = date.and_hms_opt(0, number("MINUTES").unwrap_or(0), number("SECONDS").unwrap_or(0))?;
        // hour 24 is accepted by the mask and rolls into the next day
        time.checked_add_signed(Duration::hours(i64::from(number("HOUR").unwrap_or(0))))
    }
}

/// Translate a mask into a regular expression.
///
/// The mask is split on the group delimiters; whether even or odd segments
/// are groups depends on whether the mask opens with `%(`.
pub fn mask_to_regex(mask: &str) -> String {
    let starts_with_group = mask.starts_with(GROUP_OPEN);
    let body = if starts_with_group {
        &mask[GROUP_OPEN.len()..]
    } else {
        mask
    };

    let mut pattern = String::with_capacity(mask.len() * 2);
    for (index, segment) in split_groups(body).into_iter().enumerate() {
        let is_group = (index % 2 == 0) == starts_with_group;
        if is_group {
            pattern.push('(');
            pattern.push_str(segment);
            pattern.push(')');
        } else {
            pattern.push_str(&literal_to_regex(segment));
        }
    }
    pattern.push_str(COMPRESSION_SUFFIX);
    pattern
}

fn split_groups(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut rest = body;
    loop {
        let next = [rest.find(GROUP_OPEN), rest.find(GROUP_CLOSE)]
            .into_iter()
            .flatten()
            .min();
        match next {
            Some(idx) => {
                parts.push(&rest[..idx]);
                rest = &rest[idx + 2..];
            }
            None => {
                parts.push(rest);
                return parts;
            }
        }
    }
}

fn literal_to_regex(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len() * 2);
    let mut rest = segment;

    while let Some(c) = rest.chars().next() {
        if let Some((token, regex, _)) = TOKENS.iter().find(|(t, _, _)| rest.starts_with(t)) {
            out.push_str(regex);
            rest = &rest[token.len()..];
            continue;
        }
        if c == '*' {
            out.push_str(".*");
        } else {
            let mut buf = [0u8; 4];
            out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
        }
        rest = &rest[c.len_utf8()..];
    }
    out
}

/// Place a two-digit year in the 20th or 21st century.
pub fn resolve_century(two_digit_year: i32, reference_year: i32) -> i32 {
    let distance = reference_year - two_digit_year;
    if distance > 1999 {
        two_digit_year + 2000
    } else if distance > 1899 {
        two_digit_year + 1900
    } else {
        two_digit_year
    }
}

/// Split `dir/sub/name_%YYYY.tif` into `("dir/sub", "name_%YYYY.tif")`.
pub fn split_mask(mask: &str) -> (&str, &str) {
    mask.rsplit_once('/').unwrap_or(("", mask))
}

/// strftime format for the date part of a file mask: everything from the
/// first `%` up to the following `.`.
pub fn archive_date_format(file_mask: &str) -> String {
    let Some(start) = file_mask.find('%') else {
        return DEFAULT_DATE_FORMAT.to_string();
    };
    let tail = &file_mask[start..];
    let date_part = tail.find('.').map_or(tail, |end| &tail[..end]);

    let mut format = String::new();
    let mut rest = date_part;
    let mut has_token = false;
    while let Some(c) = rest.chars().next() {
        if let Some((token, _, strftime)) = TOKENS.iter().find(|(t, _, _)| rest.starts_with(t)) {
            format.push_str(strftime);
            rest = &rest[token.len()..];
            has_token = true;
            continue;
        }
        match c {
            '%' => format.push_str("%%"),
            '*' => {}
            other => format.push(other),
        }
        rest = &rest[c.len_utf8()..];
    }

    let valid = !StrftimeItems::new(&format).any(|item| matches!(item, Item::Error));
    if has_token && valid {
        format
    } else {
        DEFAULT_DATE_FORMAT.to_string()
    }
}

/// Archive file name for a run: `now` rendered with the mask's own date
/// tokens. Runs within the same period share one archive.
pub fn archive_name(file_mask: &str, now: DateTime<Utc>) -> String {
    let format = archive_date_format(file_mask);
    format!("{}.zip", now.format(&format))
}
