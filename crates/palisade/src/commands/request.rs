//! Request command - send an authenticated request.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use palisade_session::{ApiRequest, ApiResponse};
use reqwest::Method;

use super::{Context, report_session_events};

/// Arguments for the request command.
#[derive(Args, Debug)]
pub struct RequestArgs {
    /// HTTP method (GET, POST, PUT, PATCH, DELETE)
    pub method: String,

    /// Request path, relative to the server URL
    pub path: String,

    /// JSON request body
    #[arg(short, long)]
    pub data: Option<String>,

    /// Query parameter as key=value (repeatable)
    #[arg(short, long = "query", value_parser = parse_key_val)]
    pub query: Vec<(String, String)>,

    /// Upload a file as multipart form data
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,

    /// Content type of the uploaded file
    #[arg(long, default_value = "application/octet-stream", requires = "file")]
    pub content_type: String,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    Ok((key.to_string(), value.to_string()))
}

/// Run the request command.
pub async fn run(args: RequestArgs, ctx: &Context) -> Result<()> {
    let request = build_request(&args)?;
    let client = ctx.client()?;
    let mut events = client.subscribe();

    let result = client.send(&request).await;
    report_session_events(&mut events, ctx);

    match result {
        Ok(response) => {
            print_response(&response, ctx)?;
            Ok(())
        }
        Err(e) => {
            if ctx.json_output {
                let output = serde_json::json!({
                    "error": e.code(),
                    "status": e.status(),
                    "message": e.message(),
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            Err(anyhow::Error::new(e).context(format!("{} failed", request)))
        }
    }
}

fn build_request(args: &RequestArgs) -> Result<ApiRequest> {
    let method = Method::from_str(&args.method.to_uppercase())
        .with_context(|| format!("invalid HTTP method '{}'", args.method))?;

    let mut request = if let Some(file) = &args.file {
        if method != Method::POST {
            bail!("file uploads are sent with POST");
        }
        let data = std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        ApiRequest::upload(args.path.as_str(), file_name, args.content_type.as_str(), data)
    } else {
        ApiRequest::new(method, args.path.as_str())
    };

    if let Some(data) = &args.data {
        let body: serde_json::Value =
            serde_json::from_str(data).context("request body is not valid JSON")?;
        request = request.with_json(&body)?;
    }

    for (key, value) in &args.query {
        request = request.with_query(key.as_str(), value.as_str());
    }

    Ok(request)
}

fn print_response(response: &ApiResponse, ctx: &Context) -> Result<()> {
    if response.body.is_empty() {
        if !ctx.json_output {
            println!("{} (no content)", response.status);
        }
        return Ok(());
    }

    match response.json::<serde_json::Value>() {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{}", response.text()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_session::RequestBody;

    fn args(method: &str, path: &str) -> RequestArgs {
        RequestArgs {
            method: method.to_string(),
            path: path.to_string(),
            data: None,
            query: Vec::new(),
            file: None,
            content_type: "application/octet-stream".to_string(),
        }
    }

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("q=rust=fast").unwrap(),
            ("q".to_string(), "rust=fast".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
    }

    #[test]
    fn test_build_json_request() {
        let mut args = args("post", "/documents");
        args.data = Some(r#"{"title":"x"}"#.to_string());
        args.query = vec![("draft".to_string(), "true".to_string())];

        let request = build_request(&args).unwrap();
        assert_eq!(request.method(), &Method::POST);
        assert_eq!(request.body(), &RequestBody::Json(serde_json::json!({"title": "x"})));
        assert_eq!(request.query(), &[("draft".to_string(), "true".to_string())]);
    }

    #[test]
    fn test_build_rejects_bad_json() {
        let mut args = args("POST", "/documents");
        args.data = Some("{not json".to_string());
        assert!(build_request(&args).is_err());
    }

    #[test]
    fn test_build_upload() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, "hello").unwrap();

        let mut args = args("POST", "/files");
        args.file = Some(file);
        args.content_type = "text/plain".to_string();

        let request = build_request(&args).unwrap();
        match request.body() {
            RequestBody::Upload {
                file_name,
                content_type,
                ..
            } => {
                assert_eq!(file_name, "notes.txt");
                assert_eq!(content_type, "text/plain");
            }
            other => panic!("expected upload, got {:?}", other),
        }
    }
}
