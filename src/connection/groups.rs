//! Group selection, group listings, overview queries, and date seeking

use super::{GroupCursor, NntpConnection};
use crate::codec::{
    Decoded, DecoderChain, GroupEntry, GroupListDecoder, OverviewEntry, XoverDecoder, XoverSort,
    date_key,
};
use crate::commands::{self, GroupSummary};
use crate::error::{Error, Result};
use crate::response::codes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Overview query retries on transient failures
const NNTP_XOVER_RETRIES: u32 = 5;

/// Probe window width for date seeking
const MAX_MISSES: u64 = 20;

/// Safety valve for pathological date-seek loops
const MAX_SEEK_PROBES: u32 = 200;

impl NntpConnection {
    /// Select a group and update the cursors
    ///
    /// Returns the parsed summary, or None when the server reports no such
    /// group (the cursors are cleared in that case).
    pub async fn select_group(&mut self, name: &str) -> Result<Option<GroupSummary>> {
        self.send_command(&commands::group(name)).await?;
        let response = self.read_status().await?;

        if response.code == codes::NO_SUCH_GROUP {
            warn!("no such group: {}", name);
            self.group = None;
            return Ok(None);
        }
        if response.code != codes::GROUP_SELECTED {
            return Err(Error::Protocol {
                code: response.code,
                message: response.message,
            });
        }

        let summary = commands::parse_group_response(&response)?;
        self.group = Some(GroupCursor {
            name: summary.name.clone(),
            count: summary.count,
            low: summary.low,
            high: summary.high,
            index: summary.low,
        });
        debug!(
            "group {}: count={} low={} high={}",
            summary.name, summary.count, summary.low, summary.high
        );
        Ok(Some(summary))
    }

    /// Fetch the group list, optionally filtered
    ///
    /// Filters are case-insensitive name prefixes. With `lazy` set, the
    /// parsed listing is cached on the connection and reused until a
    /// non-lazy call refreshes it.
    pub async fn list_groups(&mut self, filters: &[String], lazy: bool) -> Result<Vec<GroupEntry>> {
        if !lazy || self.group_cache.is_none() {
            self.send_command(commands::list_active()).await?;
            let mut response = self.read_status().await?;
            if response.code != codes::LIST_FOLLOWS {
                return Err(Error::Protocol {
                    code: response.code,
                    message: response.message,
                });
            }

            let mut chain = DecoderChain::new(vec![Box::new(GroupListDecoder::new())]);
            let extras = self.read_multiline(&mut response, &mut chain).await?;
            let entries = extras
                .into_iter()
                .find_map(|value| match value {
                    Decoded::Groups(entries) => Some(entries),
                    _ => None,
                })
                .unwrap_or_default();
            debug!("LIST ACTIVE: {} group(s)", entries.len());
            self.group_cache = Some(entries);
        }

        let cached = self.group_cache.as_deref().unwrap_or(&[]);
        if filters.is_empty() {
            return Ok(cached.to_vec());
        }
        let lowered: Vec<String> = filters.iter().map(|f| f.to_lowercase()).collect();
        Ok(cached
            .iter()
            .filter(|entry| lowered.iter().any(|f| entry.name.starts_with(f.as_str())))
            .cloned()
            .collect())
    }

    /// Query overview records for an article-number range
    ///
    /// Results are keyed by the chosen sort policy. Transient failures are
    /// retried up to the overview retry budget with all decoders reset
    /// between attempts; an empty range (423) is an empty map, not an error.
    pub async fn xover(
        &mut self,
        group: Option<&str>,
        start: u64,
        end: u64,
        sort: XoverSort,
    ) -> Result<BTreeMap<String, OverviewEntry>> {
        if let Some(name) = group
            && self.group.as_ref().map(|g| g.name.as_str()) != Some(name)
            && self.select_group(name).await?.is_none()
        {
            return Err(Error::NoSuchGroup(name.to_string()));
        }
        if self.group.is_none() {
            return Err(Error::Protocol {
                code: codes::NO_GROUP_SELECTED,
                message: "no newsgroup selected".to_string(),
            });
        }

        let mut chain = DecoderChain::new(vec![Box::new(XoverDecoder::new())]);
        let mut last_error = None;

        for attempt in 0..NNTP_XOVER_RETRIES {
            if !self.is_connected() {
                self.connect().await?;
            }

            match self.xover_once(start, end, &mut chain).await {
                Ok(entries) => {
                    let mut sorted = BTreeMap::new();
                    for entry in entries {
                        sorted.insert(entry.sort_key(sort), entry);
                    }
                    return Ok(sorted);
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "XOVER {}-{} attempt {}/{} failed: {}",
                        start,
                        end,
                        attempt + 1,
                        NNTP_XOVER_RETRIES,
                        e
                    );
                    chain.reset();
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| Error::FetchError("XOVER retries exhausted".to_string())))
    }

    async fn xover_once(
        &mut self,
        start: u64,
        end: u64,
        chain: &mut DecoderChain,
    ) -> Result<Vec<OverviewEntry>> {
        self.send_command(&commands::xover(start, end)).await?;
        let mut response = self.read_status().await?;

        if response.code == codes::NO_SUCH_ARTICLE_NUMBER {
            // nothing in the range; a routine condition while probing
            return Ok(Vec::new());
        }
        if response.code != codes::OVERVIEW_FOLLOWS {
            return Err(Error::Protocol {
                code: response.code,
                message: response.message,
            });
        }

        let extras = self.read_multiline(&mut response, chain).await?;
        Ok(extras
            .into_iter()
            .find_map(|value| match value {
                Decoded::Overview(entries) => Some(entries),
                _ => None,
            })
            .unwrap_or_default())
    }

    /// Position the group cursor at the first article dated at or after
    /// `refdate`
    ///
    /// Binary search over the article-number space using overview probes of
    /// [`MAX_MISSES`] articles. Invariant: if a qualifying article exists,
    /// its number lies in `[head, tail]`; each probe either answers from
    /// its window or discards the half that cannot hold the answer. Empty
    /// probes (expired ranges) shift the window toward the tail. Returns
    /// the group head when no article qualifies.
    pub async fn seek_by_date(
        &mut self,
        refdate: DateTime<Utc>,
        group: Option<&str>,
    ) -> Result<u64> {
        if let Some(name) = group
            && self.group.as_ref().map(|g| g.name.as_str()) != Some(name)
            && self.select_group(name).await?.is_none()
        {
            return Err(Error::NoSuchGroup(name.to_string()));
        }
        let cursor = self
            .group
            .clone()
            .ok_or_else(|| Error::Protocol {
                code: codes::NO_GROUP_SELECTED,
                message: "no newsgroup selected".to_string(),
            })?;

        let ref_key = date_key(&refdate);
        let mut head = cursor.low;
        let mut tail = cursor.high;
        let mut probes = 0u32;

        let found = loop {
            probes += 1;
            if probes > MAX_SEEK_PROBES || tail <= head {
                break None;
            }
            let span = tail - head;

            if span <= MAX_MISSES {
                // the window fits one probe; answer by bisection
                let entries = self.xover(None, head, tail, XoverSort::ByTime).await?;
                break entries
                    .range(ref_key.clone()..)
                    .next()
                    .map(|(_, entry)| entry.article_no);
            }

            let start = head + span / 2 - MAX_MISSES / 2;
            let end = (start + MAX_MISSES).min(tail);
            let entries = self.xover(None, start, end - 1, XoverSort::ByTime).await?;

            if entries.is_empty() {
                // expired window; shift right, closing from the tail once
                // the right side is exhausted
                if end >= tail {
                    tail = start;
                } else {
                    head = end;
                }
                continue;
            }

            let first = entries.keys().next().cloned().unwrap_or_default();
            let last = entries.keys().next_back().cloned().unwrap_or_default();

            if last < ref_key {
                // everything here predates the reference; go right
                head = end;
            } else if first >= ref_key {
                // everything here postdates the reference; go left
                tail = start;
            } else {
                // the boundary is inside this window
                break entries
                    .range(ref_key.clone()..)
                    .next()
                    .map(|(_, entry)| entry.article_no);
            }
        };

        let index = match found {
            Some(article_no) => {
                debug!("date seek matched article {}", article_no);
                article_no
            }
            None => {
                debug!("date seek found no match; returning group head");
                cursor.low
            }
        };
        if let Some(group) = self.group.as_mut() {
            group.index = index;
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_window_constant() {
        assert_eq!(MAX_MISSES, 20);
        assert_eq!(NNTP_XOVER_RETRIES, 5);
    }

    #[test]
    fn test_probe_window_centering() {
        // the probe window is centered on the midpoint of [head, tail]
        let (head, tail) = (1000u64, 2000u64);
        let span = tail - head;
        let start = head + span / 2 - MAX_MISSES / 2;
        let end = (start + MAX_MISSES).min(tail);
        assert_eq!(start, 1490);
        assert_eq!(end, 1510);
    }
}
