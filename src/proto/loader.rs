//! Loading prototext files named on the command line.
use super::Message;
use crate::error::{config_bail, Error, Result};
use clap::Args;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The files describing one model.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PrototextFnTriple {
    /// The model file.
    pub model: PathBuf,
    /// The data reader file.
    pub reader: Option<PathBuf>,
    /// The data set metadata file.
    pub data_set_metadata: Option<PathBuf>,
    /// The optimizer file.
    pub optimizer: Option<PathBuf>,
}

/// Prototext file flags.
///
/// Each flag takes a single path, or a brace enclosed list: `--model={a.prototext,b.prototext}`.
#[derive(Args, Clone, Debug, Default)]
pub struct PrototextArgs {
    /// Model prototext file(s).
    #[arg(long = "model", value_name = "PATH|{PATH,...}")]
    pub model: Option<String>,
    /// Data reader prototext file(s), one for every model or one shared by all.
    #[arg(long = "reader", value_name = "PATH|{PATH,...}")]
    pub reader: Option<String>,
    /// Data set metadata prototext file(s), one for every model or one shared by all.
    #[arg(long = "data_set_metadata", value_name = "PATH|{PATH,...}")]
    pub data_set_metadata: Option<String>,
    /// Optimizer prototext file(s), one for every model or one shared by all.
    #[arg(long = "optimizer", value_name = "PATH|{PATH,...}")]
    pub optimizer: Option<String>,
}

fn parse_filename_list(flag: &str, value: &str) -> Result<Vec<PathBuf>> {
    let value = value.trim();
    let names: Vec<&str> = match value.strip_prefix('{') {
        Some(inner) => {
            let Some(inner) = inner.strip_suffix('}') else {
                config_bail!("--{flag}={value}: missing closing '}}'");
            };
            inner.split(',').map(str::trim).collect()
        }
        None => vec![value],
    };
    if names.iter().any(|name| name.is_empty()) {
        config_bail!("--{flag}={value}: empty file name");
    }
    Ok(names.into_iter().map(PathBuf::from).collect())
}

// One per model: a single value is shared by every model.
fn broadcast(flag: &str, value: Option<&str>, num_models: usize) -> Result<Vec<Option<PathBuf>>> {
    let Some(value) = value else {
        return Ok(vec![None; num_models]);
    };
    let names = parse_filename_list(flag, value)?;
    match names.len() {
        1 => Ok(vec![names.into_iter().next(); num_models]),
        n if n == num_models => Ok(names.into_iter().map(Some).collect()),
        n => Err(Error::config(format!(
            "--{flag} names {n} files but --model names {num_models}"
        ))),
    }
}

/// Parses the prototext file flags into one [`PrototextFnTriple`] per model.
///
/// `master` is whether this is the coordinating process. Errors are returned on every process and
/// reported by the caller on the coordinating one.
///
/// **Errors**
/// - `--model` is missing, or a list is malformed.
/// - More than one reader, metadata or optimizer file is named, but not one per model.
pub fn parse_prototext_filenames_from_command_line(
    master: bool,
    args: &PrototextArgs,
) -> Result<Vec<PrototextFnTriple>> {
    let Some(model) = args.model.as_deref() else {
        config_bail!("--model is required");
    };
    let models = parse_filename_list("model", model)?;
    let n = models.len();
    let readers = broadcast("reader", args.reader.as_deref(), n)?;
    let metadata = broadcast("data_set_metadata", args.data_set_metadata.as_deref(), n)?;
    let optimizers = broadcast("optimizer", args.optimizer.as_deref(), n)?;
    let triples: Vec<_> = models
        .into_iter()
        .zip(readers)
        .zip(metadata)
        .zip(optimizers)
        .map(
            |(((model, reader), data_set_metadata), optimizer)| PrototextFnTriple {
                model,
                reader,
                data_set_metadata,
                optimizer,
            },
        )
        .collect();
    if master {
        log::debug!("prototext files: {triples:?}");
    }
    Ok(triples)
}

/// Reads the files of every triple into one document per model.
///
/// The reader, metadata and optimizer documents are appended to the model document. Models are
/// read in parallel.
///
/// **Errors**
/// - A file could not be read or parsed. The error names the file.
pub fn read_in_prototext_files(
    master: bool,
    triples: &[PrototextFnTriple],
) -> Result<Vec<Message>> {
    triples
        .par_iter()
        .map(|triple| {
            let mut doc = Message::from_file(&triple.model)?;
            let others = [&triple.reader, &triple.data_set_metadata, &triple.optimizer];
            for path in others.into_iter().flatten() {
                doc.merge(Message::from_file(path)?);
            }
            if master {
                log::debug!("read {:?}", triple.model);
            }
            Ok(doc)
        })
        .collect()
}

/// Checks that every document has a data reader with at least one reader, and an optimizer.
///
/// Every problem is collected into the one returned error, which the caller reports on the
/// coordinating process.
///
/// **Errors**
/// - A document is missing a required section.
pub fn verify_prototext(master: bool, docs: &[Message]) -> Result<()> {
    let mut problems = Vec::new();
    for (i, doc) in docs.iter().enumerate() {
        match doc.message("data_reader") {
            None => problems.push(format!("model {i}: missing data_reader")),
            Some(data_reader) if data_reader.messages("reader").next().is_none() => {
                problems.push(format!("model {i}: data_reader has no reader"))
            }
            Some(_) => (),
        }
        if !doc.contains("optimizer") {
            problems.push(format!("model {i}: missing optimizer"));
        }
    }
    if !problems.is_empty() {
        return Err(Error::config(problems.join("; ")));
    }
    if master {
        log::debug!("verified {} documents", docs.len());
    }
    Ok(())
}

/// Parses the flags, reads the files and verifies the documents.
///
/// **Errors**
/// - See [`parse_prototext_filenames_from_command_line()`], [`read_in_prototext_files()`] and
///   [`verify_prototext()`].
pub fn load_prototext(master: bool, args: &PrototextArgs) -> Result<Vec<Message>> {
    let triples = parse_prototext_filenames_from_command_line(master, args)?;
    let docs = read_in_prototext_files(master, &triples)?;
    verify_prototext(master, &docs)?;
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::fs;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        prototext: PrototextArgs,
    }

    fn args(argv: &[&str]) -> PrototextArgs {
        Cli::try_parse_from(std::iter::once("shardnet").chain(argv.iter().copied()))
            .unwrap()
            .prototext
    }

    #[test]
    fn broadcast_single_reader() {
        let args = args(&["--model={a,b,c}", "--reader=r", "--optimizer=o"]);
        let triples = parse_prototext_filenames_from_command_line(true, &args).unwrap();
        assert_eq!(triples.len(), 3);
        for (triple, model) in triples.iter().zip(["a", "b", "c"]) {
            assert_eq!(triple.model, PathBuf::from(model));
            assert_eq!(triple.reader, Some(PathBuf::from("r")));
            assert_eq!(triple.optimizer, Some(PathBuf::from("o")));
            assert_eq!(triple.data_set_metadata, None);
        }
    }

    #[test]
    fn one_per_model() {
        let args = args(&["--model", "{a, b}", "--reader={r1,r2}"]);
        let triples = parse_prototext_filenames_from_command_line(false, &args).unwrap();
        assert_eq!(triples[1].reader, Some(PathBuf::from("r2")));
    }

    #[test]
    fn mismatched_counts() {
        let args = args(&["--model={a,b,c}", "--reader={r1,r2}", "--optimizer=o"]);
        let error = parse_prototext_filenames_from_command_line(true, &args).unwrap_err();
        assert!(error.is_config());
    }

    #[test]
    fn malformed_lists() {
        for model in ["--model={a,b", "--model={a,,b}"] {
            let error =
                parse_prototext_filenames_from_command_line(true, &args(&[model])).unwrap_err();
            assert!(error.is_config());
        }
        let error = parse_prototext_filenames_from_command_line(true, &args(&[])).unwrap_err();
        assert!(error.is_config());
    }

    #[test]
    fn load_merges_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.prototext");
        let reader = dir.path().join("reader.prototext");
        let optimizer = dir.path().join("opt.prototext");
        fs::write(&model, "model { mini_batch_size: 4 }").unwrap();
        fs::write(&reader, "data_reader { reader { role: \"train\" } }").unwrap();
        fs::write(&optimizer, "optimizer { sgd { learn_rate: 0.1 } }").unwrap();
        let flag = |name: &str, path: &std::path::Path| format!("--{name}={}", path.display());
        let flags = [
            flag("model", model.as_path()),
            flag("reader", reader.as_path()),
            flag("optimizer", optimizer.as_path()),
        ];
        let args = args(&flags.iter().map(String::as_str).collect::<Vec<_>>());
        let docs = load_prototext(true, &args).unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].contains("model"));
        assert!(docs[0].contains("data_reader"));

        let args = PrototextArgs {
            optimizer: None,
            ..args
        };
        assert!(load_prototext(true, &args).unwrap_err().is_config());
    }

    #[test]
    fn parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("broken.prototext");
        fs::write(&model, "model { layer {").unwrap();
        let triples = [PrototextFnTriple {
            model: model.clone(),
            ..Default::default()
        }];
        match read_in_prototext_files(true, &triples).unwrap_err() {
            Error::Parse { path, .. } => assert_eq!(path, model),
            e => panic!("{e}"),
        }
    }

    #[test]
    fn verify_requires_sections() {
        let doc = Message::parse("data_reader { }\noptimizer { }", "x").unwrap();
        assert!(verify_prototext(false, &[doc]).unwrap_err().is_config());
    }

    #[test]
    fn verify_reports_every_problem_once() {
        let docs = [
            Message::parse("optimizer { }", "a").unwrap(),
            Message::parse("data_reader { reader { role: \"train\" } }", "b").unwrap(),
        ];
        let message = verify_prototext(true, &docs).unwrap_err().to_string();
        assert!(message.contains("model 0: missing data_reader"));
        assert!(message.contains("model 1: missing optimizer"));
        assert_eq!(message.matches("model 0").count(), 1);
    }
}
