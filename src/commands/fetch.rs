use anyhow::{Context, Result, bail};
use futures_util::future::join_all;
use log::info;
use serde_json::{Map, Value};
use std::io::Write;

use crate::{
    client::{ApiClient, FetchOptions},
    runtime::Runtime,
    transport::{Request, Transport},
};

/// What to fetch and how to print it.
#[derive(Debug, Clone, Default)]
pub struct FetchSpec {
    pub paths: Vec<String>,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    /// One item per line instead of a JSON document
    pub ndjson: bool,
}

impl FetchSpec {
    fn template(&self, path: &str) -> Request {
        let request = self
            .query
            .iter()
            .fold(Request::get(path), |req, (k, v)| req.with_query(k.clone(), v.clone()));
        self.headers
            .iter()
            .fold(request, |req, (k, v)| req.with_header(k.clone(), v.clone()))
    }
}

/// Parses `key=value`.
pub fn parse_query_pair(s: &str) -> Result<(String, String)> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => bail!("Invalid query parameter '{}'. Expected 'key=value'.", s),
    }
}

/// Parses `Name: value`.
pub fn parse_header_pair(s: &str) -> Result<(String, String)> {
    match s.split_once(':') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.trim().to_string())),
        _ => bail!("Invalid header '{}'. Expected 'Name: value'.", s),
    }
}

/// Fetches every path and writes the items to `out`.
///
/// Paths are independent collections and are fetched concurrently. With a
/// single path the output is a JSON array; with several it is an object
/// keyed by path. On failure nothing is written unless partial results were
/// asked for and some items were collected.
#[tracing::instrument(skip(client, options, out))]
pub async fn fetch<T: Transport, R: Runtime, W: Write>(
    client: &ApiClient<T, R>,
    spec: &FetchSpec,
    options: &FetchOptions,
    out: &mut W,
) -> Result<()> {
    if spec.paths.is_empty() {
        bail!("Nothing to fetch: no paths given");
    }

    let templates: Vec<Request> = spec.paths.iter().map(|p| spec.template(p)).collect();
    let results = join_all(
        templates
            .iter()
            .map(|template| client.fetch_all_with::<Value>(template, options)),
    )
    .await;

    let mut collected: Vec<(String, Vec<Value>)> = Vec::new();
    let mut first_error = None;

    for (path, result) in spec.paths.iter().zip(results) {
        match result {
            Ok(items) => {
                info!("{}: {} items", path, items.len());
                collected.push((path.clone(), items));
            }
            Err(failure) => {
                if !failure.items.is_empty() {
                    collected.push((path.clone(), failure.items));
                }
                if first_error.is_none() {
                    first_error = Some(
                        anyhow::Error::from(failure.error)
                            .context(format!("Failed to fetch {}", path)),
                    );
                }
            }
        }
    }

    match first_error {
        None => write_items(&collected, spec.paths.len() > 1, spec.ndjson, out),
        Some(e) => {
            let keep_partial = options.keep_partial || client.keeps_partial();
            if keep_partial && !collected.is_empty() {
                write_items(&collected, spec.paths.len() > 1, spec.ndjson, out)?;
            }
            Err(e)
        }
    }
}

fn write_items<W: Write>(
    collected: &[(String, Vec<Value>)],
    keyed: bool,
    ndjson: bool,
    out: &mut W,
) -> Result<()> {
    if ndjson {
        for (_, items) in collected {
            for item in items {
                writeln!(out, "{}", item).context("Failed to write output")?;
            }
        }
        return Ok(());
    }

    let document = if keyed {
        let map: Map<String, Value> = collected
            .iter()
            .map(|(path, items)| (path.clone(), Value::Array(items.clone())))
            .collect();
        Value::Object(map)
    } else {
        Value::Array(collected.iter().flat_map(|(_, items)| items.clone()).collect())
    };

    serde_json::to_writer_pretty(&mut *out, &document).context("Failed to write output")?;
    writeln!(out).context("Failed to write output")?;
    Ok(())
}
