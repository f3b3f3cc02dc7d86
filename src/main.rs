use std::path::PathBuf;
use std::sync::Arc;

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use searchql::token::{Node, TokenGroup};
use searchql::{
    BaseRequest, CatalogResolver, DocCatalog, ExpressionContext, SearchRequestFactory, StructureBuilder, SyntaxError,
    Tokeniser,
};

const HELP: &str = "\
Enter a query, e.g. `from Events where UserId = jbloggs | table UserId, EventTime`.
End a line with `\\` to continue the query on the next line.

  .tokens <query>   show the tokens of a query
  .tree <query>     show the structure of a query
  .help             show this message
  .quit             exit";

/// 加载文档目录, 失败时使用空目录, REPL 仍然可以查看 token 和结构
fn load_catalog(path: &str) -> DocCatalog {
    match DocCatalog::from_json_file(path) {
        Ok(catalog) => {
            info!(
                path,
                data_sources = catalog.data_sources.len(),
                documents = catalog.documents.len(),
                "Loaded catalog"
            );
            catalog
        }
        Err(e) => {
            warn!(path, error = %e, "Unable to load catalog, using an empty one");
            DocCatalog::default()
        }
    }
}

fn history_path() -> PathBuf {
    PathBuf::from(".searchql_history")
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "searchql=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let catalog_path = std::env::args().nth(1).unwrap_or_else(|| "catalog.json".to_string());
    let catalog = load_catalog(&catalog_path);
    let factory = SearchRequestFactory::new(Arc::new(CatalogResolver::new(catalog)));
    let request = BaseRequest::default();
    let context = ExpressionContext::default();

    let mut editor = DefaultEditor::new()?;
    let history = history_path();
    if history.exists() {
        if let Err(e) = editor.load_history(&history) {
            debug!(error = %e, "Unable to load history");
        }
    }

    println!("searchql {} (.help for commands)", env!("CARGO_PKG_VERSION"));
    let mut buffer = String::new();
    loop {
        let prompt = if buffer.is_empty() { "searchql> " } else { "     ...> " };
        let line = match editor.readline(prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                buffer.clear();
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };

        if let Some(partial) = line.strip_suffix('\\') {
            buffer.push_str(partial);
            buffer.push('\n');
            continue;
        }
        buffer.push_str(&line);
        let input = std::mem::take(&mut buffer);
        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        if let Err(e) = editor.add_history_entry(input) {
            debug!(error = %e, "Unable to add history entry");
        }

        if input == ".quit" || input == ".exit" {
            break;
        } else if input == ".help" {
            println!("{HELP}");
        } else if let Some(query) = input.strip_prefix(".tokens") {
            for token in Tokeniser::parse(query.trim()) {
                println!("{:?}", token);
            }
        } else if let Some(query) = input.strip_prefix(".tree") {
            let query = query.trim();
            let tokens = Tokeniser::parse(query);
            match StructureBuilder::build(&tokens) {
                Ok(root) => print_tree(&root, 0),
                Err(e) => print_error(query, &e),
            }
        } else {
            match factory.create(input, &request, &context) {
                Ok(search_request) => println!("{}", serde_json::to_string_pretty(&search_request)?),
                Err(e) => print_error(input, &e),
            }
        }
    }

    if let Err(e) = editor.save_history(&history) {
        warn!(error = %e, "Unable to save history");
    }
    Ok(())
}

fn print_tree(group: &TokenGroup<'_>, depth: usize) {
    println!("{:indent$}{} {:?}", "", group.token_kind(), group.text(), indent = depth * 2);
    for child in group.children() {
        match child {
            Node::Group(inner) => print_tree(inner, depth + 1),
            Node::Token(token) => {
                println!("{:indent$}{} {:?}", "", token.kind, token.slice(), indent = (depth + 1) * 2)
            }
        }
    }
}

/// 打印错误信息, 以及出错的查询行和 span 下方的标记
fn print_error(query: &str, error: &SyntaxError) {
    println!("Error: {}", error.message());
    let Some(span) = error.span() else {
        return;
    };
    // span 不在查询文本内时只打印错误信息
    let (Some(before), Some(after)) = (query.get(..span.start), query.get(span.start..)) else {
        return;
    };
    let line_start = before.rfind('\n').map_or(0, |i| i + 1);
    let line_end = after.find('\n').map_or(query.len(), |i| span.start + i);
    let column = before[line_start..].chars().count();
    let width = query
        .get(span.start..span.end.min(line_end))
        .map_or(1, |text| text.chars().count().max(1));
    println!("  {}", &query[line_start..line_end]);
    println!("  {}{}", " ".repeat(column), "^".repeat(width));
}
