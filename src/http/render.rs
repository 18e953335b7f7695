//! HTML and text pages
//!
//! Listings are rendered as a preformatted, column-aligned index page in the
//! style of a classic web server directory listing.

use std::fmt::Write;

use pulldown_cmark::{html, Options, Parser};

use crate::auth::CoordinatorStatus;
use crate::cache::{CachedFile, ListingSnapshot};
use crate::config::Settings;
use crate::graph::Entry;

/// Listing column to sort by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Name,
    Modified,
    Size,
}

impl SortKey {
    /// Parse the `c=` query value, defaulting to name
    pub fn from_query(value: Option<&str>) -> Self {
        match value {
            Some("t") => SortKey::Modified,
            Some("s") => SortKey::Size,
            _ => SortKey::Name,
        }
    }
}

/// Parse the `o=` query value; returns true for descending
pub fn descending(value: Option<&str>) -> bool {
    value == Some("d")
}

/// Sort folders first, then files, each group by `key`
pub fn sort_entries(entries: &mut [Entry], key: SortKey, descending: bool) {
    entries.sort_by(|a, b| {
        b.is_folder.cmp(&a.is_folder).then_with(|| {
            let ord = match key {
                SortKey::Name => a.name.cmp(&b.name),
                SortKey::Modified => a.modified_at.cmp(&b.modified_at),
                SortKey::Size if a.is_folder => a.child_count.cmp(&b.child_count),
                SortKey::Size => a.size.cmp(&b.size),
            };
            if descending {
                ord.reverse()
            } else {
                ord
            }
        })
    });
}

/// Human-readable byte count: `512`, `1.5K`, `3.0M`, `1.2G`
pub fn pretty_size(size: u64) -> String {
    const K: f64 = 1024.0;
    let s = size as f64;
    if size < 1024 {
        size.to_string()
    } else if s < K * K {
        format!("{:.1}K", s / K)
    } else if s < K * K * K {
        format!("{:.1}M", s / K / K)
    } else {
        format!("{:.1}G", s / K / K / K)
    }
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// `2020-01-02T03:04:05Z` to `2020-01-02 03:04`
fn short_time(timestamp: &str) -> String {
    match (timestamp.get(..10), timestamp.get(11..16)) {
        (Some(date), Some(time)) => format!("{} {}", date, time),
        _ => format!("{:16}", timestamp),
    }
}

/// Epoch seconds to `HH:MM` UTC
fn clock_time(epoch: i64) -> String {
    let day = epoch.rem_euclid(86_400);
    format!("{:02}:{:02}", day / 3600, (day % 3600) / 60)
}

fn spaces(out: &mut String, n: usize) {
    out.extend(std::iter::repeat(' ').take(n));
}

/// README flavours inlined under a listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadmeKind {
    Markdown,
    Text,
    Html,
}

impl ReadmeKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "readme.md" => Some(ReadmeKind::Markdown),
            "readme.txt" | "readme" => Some(ReadmeKind::Text),
            "readme.html" | "readme.htm" => Some(ReadmeKind::Html),
            _ => None,
        }
    }
}

/// First visible README file of a listing
pub fn find_readme<'a>(snapshot: &'a ListingSnapshot, settings: &Settings) -> Option<(&'a Entry, ReadmeKind)> {
    snapshot
        .entries
        .iter()
        .filter(|e| !e.is_folder && !settings.is_ignored(&e.name))
        .find_map(|e| ReadmeKind::from_name(&e.name).map(|kind| (e, kind)))
}

/// Turn README bytes into an HTML fragment
pub fn readme_html(kind: ReadmeKind, content: &[u8]) -> String {
    let text = String::from_utf8_lossy(content);
    match kind {
        ReadmeKind::Markdown => {
            let options = Options::ENABLE_TABLES | Options::ENABLE_STRIKETHROUGH;
            let mut out = String::new();
            html::push_html(&mut out, Parser::new_ext(&text, options));
            out
        }
        ReadmeKind::Text => format!("<pre>{}</pre>", escape_html(&text)),
        ReadmeKind::Html => text.into_owned(),
    }
}

/// Everything a listing page shows
pub struct ListingView<'a> {
    pub snapshot: &'a ListingSnapshot,
    pub settings: &'a Settings,
    pub key: SortKey,
    pub descending: bool,
    /// Ignored entries are shown too, marked with `* `
    pub admin: bool,
    /// Rendered README placed under the table
    pub readme: Option<String>,
    pub last_refreshed_at: i64,
}

/// Render a folder listing page
pub fn listing_page(view: &ListingView<'_>) -> String {
    let (snapshot, settings) = (view.snapshot, view.settings);
    let mut entries: Vec<Entry> = snapshot
        .entries
        .iter()
        .filter(|e| view.admin || !settings.is_ignored(&e.name))
        .cloned()
        .collect();
    sort_entries(&mut entries, view.key, view.descending);

    let label = |e: &Entry| {
        let slash = if e.is_folder { "/" } else { "" };
        if settings.is_ignored(&e.name) {
            format!("* {}{}", e.name, slash)
        } else {
            format!("{}{}", e.name, slash)
        }
    };
    let size_label = |e: &Entry| match e.child_count {
        Some(count) if e.is_folder => format!("({})", count),
        _ => pretty_size(e.size),
    };
    let name_width = entries
        .iter()
        .map(|e| label(e).chars().count())
        .max()
        .unwrap_or(0)
        .max(6);
    let size_width = entries
        .iter()
        .map(|e| size_label(e).len())
        .max()
        .unwrap_or(0)
        .max(2);

    let title = escape_html(&snapshot.path);
    let reverse = if view.descending { "a" } else { "d" };
    let mut out = String::new();
    let _ = write!(
        out,
        "<html>\n<head><meta charset=\"UTF-8\"><title>Index of {title}</title></head>\n\
         <body bgcolor=\"white\">\n<h1>Index of {title}</h1>{header}<pre>",
        header = settings.header
    );

    let _ = write!(out, "<a href=\"?c=n&o={reverse}\">Name</a>");
    spaces(&mut out, name_width + 1 - 4);
    let _ = write!(out, "<a href=\"?c=t&o={reverse}\">Last Modified</a>");
    spaces(&mut out, 3 + size_width + 2 - 4);
    let _ = writeln!(out, "<a href=\"?c=s&o={reverse}\">Size</a><hr>");

    out.push_str("<a href=\"../\">Parent Directory</a>");
    spaces(&mut out, (name_width + 1 + 16 + size_width + 2).saturating_sub(17));
    out.push_str("-\n");

    for entry in &entries {
        let name = label(entry);
        let href = if entry.is_folder {
            format!("{}{}/", snapshot.path, urlencoding::encode(&entry.name))
        } else if settings.is_prefetchable(&entry.name) {
            format!("?file={}", urlencoding::encode(&entry.name))
        } else {
            entry.download_url.clone()
        };

        let _ = write!(
            out,
            "<a href=\"{}\">{}</a>",
            escape_html(&href),
            escape_html(&name)
        );
        spaces(&mut out, name_width + 1 - name.chars().count());
        out.push_str(&short_time(&entry.modified_at));

        let size = size_label(entry);
        spaces(&mut out, size_width + 2 - size.len());
        out.push_str(&size);
        out.push('\n');
    }

    out.push_str("</pre><hr>\n");
    if let Some(readme) = &view.readme {
        out.push_str(readme);
    }
    out.push_str(&settings.footer);
    let _ = write!(
        out,
        "\n<address>onegate, last token at {}</address>\n</body></html>",
        clock_time(view.last_refreshed_at)
    );
    out
}

/// Render a failure page
pub fn error_page(message: &str) -> String {
    format!(
        "<html>\n<head><meta charset=\"UTF-8\"><title>Error</title></head>\n\
         <body bgcolor=\"white\">\n{}\n<hr>\n\
         If this is a temporary error, try refreshing this page later\n</body></html>",
        escape_html(message)
    )
}

/// Diagnostics shown on the info page
pub struct InfoView<'a> {
    pub settings: &'a Settings,
    pub status: CoordinatorStatus,
    /// (hits, misses, entries)
    pub listing_stats: (u64, u64, u64),
    pub content_weight: u64,
    pub content_budget: u64,
    pub content_entries: Vec<CachedFile>,
}

/// Render the plain-text info page, never including secrets
pub fn info_page(view: &InfoView<'_>) -> String {
    let s = view.settings;
    let mut out = String::new();

    let _ = writeln!(out, "client_id:      {}", s.client_id);
    let _ = writeln!(out, "redirect_url:   {}", s.redirect_url);
    let _ = writeln!(out, "cache_size:     {}", s.cache_size);
    let _ = writeln!(out, "cache_ttl:      {}s", s.cache_ttl.as_secs());
    let _ = writeln!(out, "prefetch_size:  {}", pretty_size(s.prefetch_bytes));
    let _ = writeln!(
        out,
        "prefetch:       {}",
        s.prefetch.as_ref().map(|r| r.as_str()).unwrap_or("-")
    );
    let _ = writeln!(
        out,
        "ignore:         {}",
        s.ignore.as_ref().map(|r| r.as_str()).unwrap_or("-")
    );
    let _ = writeln!(out, "refresh_margin: {}s", s.refresh_margin.as_secs());
    let _ = writeln!(out, "cache_dir:      {}", s.cache_dir.display());
    let _ = writeln!(out, "token_dir:      {}", s.token_dir.display());

    out.push_str("\n-- token --\n");
    let _ = writeln!(out, "generation:     {}", view.status.generation);
    let _ = writeln!(
        out,
        "last refresh:   {} ({} UTC)",
        view.status.last_refreshed_at,
        clock_time(view.status.last_refreshed_at)
    );

    let (hits, misses, entries) = view.listing_stats;
    out.push_str("\n-- listings --\n");
    let _ = writeln!(out, "entries {}, hits {}, misses {}", entries, hits, misses);

    out.push_str("\n-- content --\n");
    let _ = writeln!(
        out,
        "{} of {} used",
        pretty_size(view.content_weight),
        pretty_size(view.content_budget)
    );
    for file in &view.content_entries {
        let _ = writeln!(
            out,
            "{:6} {:>8} {}",
            file.hits,
            pretty_size(file.weight),
            file.key.display()
        );
    }

    out
}
