//! Browser-side signal extraction.
//!
//! Each extraction evaluates a small script in the rendered page and brings
//! the result back as JSON. The global-state snapshot is the delicate one:
//! it must terminate on cyclic structures, stay within a fixed depth, and
//! give up after a wall-clock budget instead of hanging the visit.

use anyhow::{anyhow, Result};
use headless_chrome::Tab;
use serde_json::Value;

use crate::browser::SessionLog;
use crate::signals::{sanitize_snapshot, PageCookie, PageLink};

/// All anchors with the URL components the link filter needs.
const LINKS_JS: &str = r#"
JSON.stringify(Array.from(document.getElementsByTagName('a')).map(({
  hash, hostname, href, pathname, protocol, rel, search,
}) => ({
  hash, hostname, href, pathname, protocol, rel, search,
})))
"#;

/// Candidate links synthesized from form actions and formaction overrides.
const FORM_LINKS_JS: &str = r#"
(() => {
  const links = [];
  const push = (raw) => {
    try {
      const url = new URL(raw, document.baseURI);
      links.push({
        hash: url.hash,
        hostname: url.hostname,
        href: url.href,
        pathname: url.pathname,
        protocol: url.protocol,
        rel: '',
        search: url.search,
      });
    } catch (error) {
      // not a resolvable action target
    }
  };
  Array.from(document.getElementsByTagName('form')).forEach((form) => {
    const action = form.getAttribute('action');
    if (action) { push(action); }
  });
  Array.from(document.querySelectorAll('button[formaction], input[formaction]'))
    .forEach((el) => push(el.getAttribute('formaction')));
  return JSON.stringify(links);
})()
"#;

/// Non-empty `script src` values.
const SCRIPTS_JS: &str = r#"
JSON.stringify(Array.from(document.getElementsByTagName('script'))
  .map((el) => el.src)
  .filter((src) => src))
"#;

/// Recursive snapshot of the global object. Hard invariants: depth bound,
/// 2 s wall-clock bound, visited-set cycle safety, and named functions
/// reduced to a `{name: ''}` marker. A failing subtree serializes as
/// `undefined` (dropped by JSON.stringify) instead of aborting the pass.
const SNAPSHOT_JS: &str = r#"
(() => {
  const started = Date.now();
  const seen = new WeakSet();
  const dereference = (obj, level) => {
    try {
      if (Date.now() - started >= 2000) { return '[Removed]'; }
      if (level > 5 || (level && obj === window)) { return '[Removed]'; }
      if (obj === null) { return null; }
      if (typeof obj === 'function') {
        return obj.name ? { [obj.name]: '' } : undefined;
      }
      if (Array.isArray(obj)) {
        return obj.map((item) => dereference(item, level + 1));
      }
      if (typeof obj === 'object') {
        if (seen.has(obj)) { return '[Removed]'; }
        seen.add(obj);
        const copy = {};
        Object.keys(obj).forEach((key) => {
          copy[key] = dereference(obj[key], level + 1);
        });
        return copy;
      }
      return obj;
    } catch (error) {
      return undefined;
    }
  };
  return JSON.stringify(dereference(window, 0));
})()
"#;

/// Fallback snapshot: plain stringify with a cycle-deduplicating replacer.
/// Values already visited are structurally copied when possible, otherwise
/// replaced with the removal placeholder.
const SNAPSHOT_FALLBACK_JS: &str = r#"
(() => {
  const cache = new Set();
  const replacer = (key, value) => {
    if (value === null) { return null; }
    if (typeof value === 'object') {
      if (cache.has(value)) {
        try {
          return JSON.parse(JSON.stringify(value));
        } catch (err) {
          return '[Removed]';
        }
      }
      cache.add(value);
    }
    if (typeof value === 'function' && value.name) {
      return { [value.name]: '' };
    }
    return value;
  };
  return JSON.stringify(window, replacer);
})()
"#;

/// Evaluate an expression that stringifies its own result and parse it back.
fn eval_json(tab: &Tab, expression: &str) -> Result<Value> {
    let object = tab
        .evaluate(expression, false)
        .map_err(|e| anyhow!("page evaluation failed: {e}"))?;
    match object.value {
        Some(Value::String(raw)) => {
            serde_json::from_str(&raw).map_err(|e| anyhow!("malformed evaluation result: {e}"))
        }
        Some(value) => Ok(value),
        None => Ok(Value::Null),
    }
}

pub fn extract_links(tab: &Tab) -> Result<Vec<PageLink>> {
    let value = eval_json(tab, LINKS_JS)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

pub fn extract_form_links(tab: &Tab) -> Result<Vec<PageLink>> {
    let value = eval_json(tab, FORM_LINKS_JS)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

pub fn extract_scripts(tab: &Tab) -> Result<Vec<String>> {
    let value = eval_json(tab, SCRIPTS_JS)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// Snapshot the page's global state. The recursive serializer runs first;
/// if it produced nothing the stringify fallback gets a chance. The result
/// is re-sanitized on this side of the process boundary.
pub fn extract_global_snapshot(tab: &Tab, log: &SessionLog) -> Value {
    let snapshot = match eval_json(tab, SNAPSHOT_JS) {
        Ok(Value::Null) => eval_json(tab, SNAPSHOT_FALLBACK_JS).unwrap_or(Value::Null),
        Err(e) => {
            log.warn(&format!("global snapshot failed, using fallback: {e}"));
            eval_json(tab, SNAPSHOT_FALLBACK_JS).unwrap_or(Value::Null)
        }
        Ok(value) => value,
    };
    sanitize_snapshot(&snapshot)
}

pub fn extract_cookies(tab: &Tab) -> Result<Vec<PageCookie>> {
    let cookies = tab
        .get_cookies()
        .map_err(|e| anyhow!("cookie read failed: {e}"))?;
    Ok(cookies
        .into_iter()
        .map(|c| PageCookie {
            name: c.name,
            value: c.value,
            domain: c.domain,
            path: c.path,
        })
        .collect())
}
