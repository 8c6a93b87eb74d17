use std::fmt;
use std::path::PathBuf;

use anyhow::Context as _;
use url::Url;

/// Marketplace a product URL belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Shopee,
    Taobao,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shopee => "shopee",
            Self::Taobao => "taobao",
        }
    }

    /// Prompt template used in legacy mode when the request names none.
    pub fn default_prompt_file(self) -> PathBuf {
        PathBuf::from("config").join(format!("prompt.{}.product.txt", self.as_str()))
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies `raw_url` by hostname. Unknown hosts are rejected.
pub fn detect(raw_url: &str) -> anyhow::Result<Source> {
    let url = Url::parse(raw_url.trim()).with_context(|| format!("invalid URL: {raw_url:?}"))?;
    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| anyhow::anyhow!("invalid URL (missing host): {raw_url:?}"))?
        .to_ascii_lowercase();

    if host_matches(&host, "shopee.tw") {
        return Ok(Source::Shopee);
    }
    if host_matches(&host, "taobao.com") || host_matches(&host, "tmall.com") {
        return Ok(Source::Taobao);
    }
    anyhow::bail!("unsupported URL host {host:?} (only Shopee/Taobao/Tmall are supported)")
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}
