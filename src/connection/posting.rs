//! Article posting (RFC 3977 two-phase POST)

use super::NntpConnection;
use crate::article::Article;
use crate::commands;
use crate::error::{Error, Result};
use crate::response::{Response, codes};
use tracing::debug;

impl NntpConnection {
    /// Post an article
    ///
    /// Sends POST, streams the serialized article after the 340 go-ahead,
    /// terminates with a lone `.` line, and returns the server's verdict
    /// (240 posted / 441 failed) as a Response. A 440 surfaces as
    /// [`Error::PostingNotPermitted`].
    pub async fn post(&mut self, article: &mut Article) -> Result<Response> {
        if !self.is_connected() {
            self.connect().await?;
        }
        debug!("posting article <{}>", article.msgid(false));

        self.send_command(commands::post()).await?;
        let response = self.read_status().await?;

        if response.code == codes::POSTING_NOT_PERMITTED {
            return Err(Error::PostingNotPermitted);
        }
        if response.code != codes::SEND_ARTICLE {
            return Err(Error::Protocol {
                code: response.code,
                message: response.message,
            });
        }

        let text = article.serialize_for_posting()?;
        self.send_bytes(&text).await?;
        self.send_command(".\r\n").await?;

        let verdict = self.read_status().await?;
        match verdict.code {
            codes::ARTICLE_POSTED => {
                debug!("article <{}> accepted", article.msgid(false));
                Ok(verdict)
            }
            codes::POSTING_FAILED => {
                debug!("article <{}> rejected: {}", article.msgid(false), verdict.message);
                Ok(verdict)
            }
            code => Err(Error::Protocol {
                code,
                message: verdict.message,
            }),
        }
    }
}
