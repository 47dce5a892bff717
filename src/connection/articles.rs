//! Article retrieval: STAT/HEAD probes and ARTICLE/BODY fetches
//!
//! A miss ("no such article") consults the ordered backups and is reported
//! distinctly from a server fault; a 5xx closes the faulting connection
//! before the backups take over.

use super::NntpConnection;
use crate::article::{Article, Header};
use crate::codec::{Decoder, DecoderChain, HeaderDecoder, UuDecoder, YencDecoder};
use crate::commands;
use crate::error::{Error, Result};
use crate::response::codes;
use std::path::Path;
use tracing::{debug, warn};

/// Outcome of a STAT/HEAD probe
#[derive(Debug)]
pub enum StatOutcome {
    /// The article exists; headers as parsed (minimal for bare STAT)
    Found(Header),
    /// The server does not carry the article
    Missing,
}

impl StatOutcome {
    /// Whether the article was found
    pub fn is_found(&self) -> bool {
        matches!(self, StatOutcome::Found(_))
    }
}

impl NntpConnection {
    /// Probe for an article by Message-ID
    ///
    /// `full` upgrades the probe from STAT to HEAD and returns the parsed
    /// header block. A miss consults each backup in order; a server fault
    /// consults the backups and surfaces the fault only if none succeeds.
    pub async fn stat(
        &mut self,
        id: &str,
        full: bool,
        group: Option<&str>,
    ) -> Result<StatOutcome> {
        let mut primary_err = None;
        match self.stat_local(id, full, group).await {
            Ok(StatOutcome::Found(header)) => return Ok(StatOutcome::Found(header)),
            Ok(StatOutcome::Missing) => debug!("{} missing on {}", id, self.config.host),
            Err(e) => {
                warn!("STAT {} failed on {}: {}", id, self.config.host, e);
                primary_err = Some(e);
            }
        }

        for backup in &mut self.backups {
            if backup.connect().await.is_err() {
                continue;
            }
            match backup.stat_local(id, full, group).await {
                Ok(StatOutcome::Found(header)) => {
                    debug!("{} found on backup {}", id, backup.config.host);
                    return Ok(StatOutcome::Found(header));
                }
                Ok(StatOutcome::Missing) => {}
                Err(e) => warn!("backup {} STAT failed: {}", backup.config.host, e),
            }
        }

        match primary_err {
            None => Ok(StatOutcome::Missing),
            Some(e) => Err(e),
        }
    }

    /// STAT/HEAD against this server only
    pub(crate) async fn stat_local(
        &mut self,
        id: &str,
        full: bool,
        group: Option<&str>,
    ) -> Result<StatOutcome> {
        if !self.is_connected() {
            self.connect().await?;
        }
        self.maybe_join(group).await?;

        if full {
            self.send_command(&commands::head(id)).await?;
            let mut response = self.read_status().await?;
            match response.code {
                codes::HEAD_FOLLOWS => {
                    let mut chain = DecoderChain::new(vec![Box::new(HeaderDecoder::new())]);
                    self.read_multiline(&mut response, &mut chain).await?;
                    let header = response.headers.take().unwrap_or_else(|| {
                        let mut minimal = Header::new();
                        minimal.push("Message-ID", commands::wire_message_id(id));
                        minimal
                    });
                    Ok(StatOutcome::Found(header))
                }
                codes::NO_SUCH_ARTICLE_ID | codes::NO_SUCH_ARTICLE_NUMBER => {
                    Ok(StatOutcome::Missing)
                }
                code => Err(Error::Protocol {
                    code,
                    message: response.message,
                }),
            }
        } else {
            self.send_command(&commands::stat(id)).await?;
            let response = self.read_status().await?;
            match response.code {
                codes::ARTICLE_STAT => {
                    let mut minimal = Header::new();
                    minimal.push("Message-ID", commands::wire_message_id(id));
                    Ok(StatOutcome::Found(minimal))
                }
                codes::NO_SUCH_ARTICLE_ID | codes::NO_SUCH_ARTICLE_NUMBER => {
                    Ok(StatOutcome::Missing)
                }
                code => Err(Error::Protocol {
                    code,
                    message: response.message,
                }),
            }
        }
    }

    /// Fetch an article by Message-ID and decode its payloads
    ///
    /// Sends ARTICLE (or BODY when the server record says so) and runs the
    /// decoder chain over the body. Returns None when the article exists
    /// nowhere (primary and backups all miss). A 5xx fault closes the
    /// faulting connection before the backups are consulted.
    pub async fn fetch(
        &mut self,
        id: &str,
        work_dir: &Path,
        group: Option<&str>,
    ) -> Result<Option<Article>> {
        let mut primary_err = None;
        match self.fetch_local(id, work_dir, group).await {
            Ok(Some(article)) => return Ok(Some(article)),
            Ok(None) => debug!("{} missing on {}", id, self.config.host),
            Err(e) => {
                warn!("fetch {} failed on {}: {}", id, self.config.host, e);
                // server fault: abandon this conversation entirely
                self.drop_stream();
                primary_err = Some(e);
            }
        }

        for backup in &mut self.backups {
            if backup.connect().await.is_err() {
                continue;
            }
            match backup.fetch_local(id, work_dir, group).await {
                Ok(Some(article)) => {
                    debug!("{} served by backup {}", id, backup.config.host);
                    return Ok(Some(article));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("backup {} fetch failed: {}", backup.config.host, e);
                    backup.drop_stream();
                }
            }
        }

        match primary_err {
            None => Ok(None),
            Some(e) => Err(e),
        }
    }

    /// ARTICLE/BODY against this server only
    pub(crate) async fn fetch_local(
        &mut self,
        id: &str,
        work_dir: &Path,
        group: Option<&str>,
    ) -> Result<Option<Article>> {
        if !self.is_connected() {
            self.connect().await?;
        }
        self.maybe_join(group).await?;

        let use_body = self.config.use_body || !self.config.use_head;
        let command = if use_body {
            commands::body(id)
        } else {
            commands::article(id)
        };
        self.send_command(&command).await?;
        let mut response = self.read_status().await?;

        let expected = if use_body {
            codes::BODY_FOLLOWS
        } else {
            codes::ARTICLE_FOLLOWS
        };
        match response.code {
            code if code == expected => {}
            codes::NO_SUCH_ARTICLE_ID | codes::NO_SUCH_ARTICLE_NUMBER => return Ok(None),
            code => {
                return Err(Error::Protocol {
                    code,
                    message: response.message,
                });
            }
        }

        // BODY responses carry no header block to decode
        let mut decoders: Vec<Box<dyn Decoder>> = Vec::with_capacity(3);
        if !use_body {
            decoders.push(Box::new(HeaderDecoder::new()));
        }
        decoders.push(Box::new(YencDecoder::new(work_dir)));
        decoders.push(Box::new(UuDecoder::new(work_dir)));
        let mut chain = DecoderChain::new(decoders);

        self.read_multiline(&mut response, &mut chain).await?;

        let mut article = Article::with_id(id);
        article.load(response)?;
        Ok(Some(article))
    }

    /// Join `group` first when this server record asks for it
    async fn maybe_join(&mut self, group: Option<&str>) -> Result<()> {
        if let Some(name) = group
            && self.config.join_group
            && self.group.as_ref().map(|g| g.name.as_str()) != Some(name)
            && self.select_group(name).await?.is_none()
        {
            return Err(Error::NoSuchGroup(name.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_outcome_predicates() {
        assert!(StatOutcome::Found(Header::new()).is_found());
        assert!(!StatOutcome::Missing.is_found());
    }
}
