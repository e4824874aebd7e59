//! Schedule page fetcher: downloads the station's daily schedule page and
//! extracts `(time, identifier, label)` rows with CSS selectors.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use station_core::config::ScheduleConfig;
use station_core::schedule::RawSlot;
use station_core::schedule_store::ScheduleFetcher;

pub struct HtmlScheduleFetcher {
    client: reqwest::Client,
    config: ScheduleConfig,
}

impl HtmlScheduleFetcher {
    pub fn new(config: ScheduleConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout())
            .user_agent(concat!("delaystation/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl ScheduleFetcher for HtmlScheduleFetcher {
    async fn fetch_schedule(&self, date: NaiveDate) -> Result<Vec<RawSlot>> {
        let url = self.config.url_for(date);
        debug!("fetch: GET {}", url);
        let html = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("requesting {}", url))?
            .error_for_status()?
            .text()
            .await?;
        parse_schedule_html(&html, &self.config)
    }
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow::anyhow!("invalid selector {:?}: {:?}", css, e))
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Identifier from a show link: the last non-empty path segment.
fn identifier_from_href(href: &str) -> Option<String> {
    let path = href.split(['?', '#']).next()?;
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Extract schedule rows.  Rows without both a time and a title (headers,
/// spacers) are skipped; time parsing happens later in the store.
pub fn parse_schedule_html(html: &str, config: &ScheduleConfig) -> Result<Vec<RawSlot>> {
    let row_sel = selector(&config.row_selector)?;
    let time_sel = selector(&config.time_selector)?;
    let title_sel = selector(&config.title_selector)?;
    let link_sel = selector(&config.link_selector)?;

    let document = Html::parse_document(html);
    let mut rows = Vec::new();
    for row in document.select(&row_sel) {
        let Some(time_cell) = row.select(&time_sel).next() else {
            continue;
        };
        let Some(title_cell) = row.select(&title_sel).next() else {
            continue;
        };
        let time_text = element_text(time_cell);
        let display_label = element_text(title_cell);
        if time_text.is_empty() || display_label.is_empty() {
            continue;
        }
        let identifier = title_cell
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(identifier_from_href)
            .unwrap_or_else(|| display_label.clone());
        rows.push(RawSlot {
            time_text,
            identifier,
            display_label,
        });
    }
    debug!("fetch: {} rows extracted", rows.len());
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
        <table class="schedule">
          <tr><th>Time</th><th>Show</th></tr>
          <tr><td class="time">12:00 AM</td><td class="title"><a href="/shows/night-owls/">Night Owls</a></td></tr>
          <tr><td class="time"> 6:00
              AM</td><td class="title"><a href="https://radio.example/shows/breakfast?x=1">The
              Breakfast Show</a></td></tr>
          <tr><td class="time">12:30 PM</td><td class="title">Lunch Hour</td></tr>
          <tr><td class="time"></td><td class="title">Ghost row</td></tr>
        </table>
        </body></html>
    "#;

    #[test]
    fn test_parse_rows() {
        let rows = parse_schedule_html(PAGE, &ScheduleConfig::default()).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].time_text, "12:00 AM");
        assert_eq!(rows[0].identifier, "night-owls");
        assert_eq!(rows[1].time_text, "6:00 AM");
        assert_eq!(rows[1].identifier, "breakfast");
        assert_eq!(rows[1].display_label, "The Breakfast Show");
        assert_eq!(rows[2].identifier, "Lunch Hour");
    }

    #[test]
    fn test_bad_selector_is_an_error() {
        let config = ScheduleConfig {
            row_selector: "tr[".to_string(),
            ..ScheduleConfig::default()
        };
        assert!(parse_schedule_html(PAGE, &config).is_err());
    }

    #[tokio::test]
    #[ignore = "needs network access and STATIOND_SCHEDULE_URL"]
    async fn test_live_fetch() {
        let config = ScheduleConfig {
            url_template: std::env::var("STATIOND_SCHEDULE_URL").unwrap(),
            ..ScheduleConfig::default()
        };
        let fetcher = HtmlScheduleFetcher::new(config).unwrap();
        let rows = fetcher
            .fetch_schedule(chrono::Local::now().date_naive())
            .await
            .unwrap();
        assert!(!rows.is_empty());
    }
}
