/// The converge-resource-runner executable
///
/// This is a separate executable because this functionality is not needed
/// during normal converge operation, and it would pollute the shell autocompletion.
use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use converge_core::{resource::PropertyMap, urn::Urn};
use converge_resource::{
    client::{CallContext, ProviderClient},
    schema::v0::{CreateRequest, DeleteRequest, ReadRequest},
};
use converge_resource_runner::{ResourceProviderClient, ResourceProviderConfig};
use serde_json::Value;

fn main() -> Result<()> {
    let args = Args::parse();

    match &args.command {
        Commands::Create {
            provider,
            urn,
            resource_type,
            inputs,
        } => {
            let inputs = inputs.collect()?;
            let request = CreateRequest {
                urn: urn.clone(),
                type_: resource_type.clone(),
                inputs,
            };
            run(provider, |client, context| async move {
                let response = client.create(&context, request).await?;
                Ok(serde_json::to_value(response)?)
            })
        }
        Commands::Read {
            provider,
            urn,
            resource_type,
            id,
        } => {
            let request = ReadRequest {
                urn: urn.clone(),
                type_: resource_type.clone(),
                id: id.clone(),
                inputs: None,
                outputs: None,
            };
            run(provider, |client, context| async move {
                let response = client.read(&context, request).await?;
                Ok(serde_json::to_value(response)?)
            })
        }
        Commands::Delete {
            provider,
            urn,
            resource_type,
            id,
            inputs,
        } => {
            let request = DeleteRequest {
                urn: urn.clone(),
                type_: resource_type.clone(),
                id: id.clone(),
                inputs: inputs.collect()?,
                outputs: PropertyMap::new(),
            };
            run(provider, |client, context| async move {
                let response = client.delete(&context, request).await?;
                Ok(serde_json::to_value(response)?)
            })
        }
        Commands::GenerateMan => {
            let cmd = Args::command();
            let man = clap_mangen::Man::new(cmd);
            let mut buffer: Vec<u8> = Default::default();
            man.render(&mut buffer)?;
            println!("{}", String::from_utf8(buffer)?);
            Ok(())
        }
        Commands::GenerateMarkdown => {
            let opts = clap_markdown::MarkdownOptions::new().show_footer(false);
            let markdown: String = clap_markdown::help_markdown_custom::<Args>(&opts);
            println!("{}", markdown);
            Ok(())
        }
        Commands::GenerateCompletion { shell } => {
            let mut cmd = Args::command();
            clap_complete::generate(
                *shell,
                &mut cmd,
                "converge-resource-runner",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    }
}

/// Start the provider, perform one call and print the response as JSON.
fn run<F, Fut>(provider: &ProviderArgs, f: F) -> Result<()>
where
    F: FnOnce(std::sync::Arc<ResourceProviderClient>, CallContext) -> Fut,
    Fut: std::future::Future<Output = Result<Value>>,
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        let client = std::sync::Arc::new(ResourceProviderClient::start(ResourceProviderConfig {
            provider_executable: provider.provider_exe.clone(),
            provider_args: provider.provider_arg.clone(),
            default_timeout: None,
        })?);
        let value = f(client.clone(), CallContext::default()).await?;
        println!("{}", serde_json::to_string_pretty(&value)?);
        match std::sync::Arc::try_unwrap(client) {
            Ok(client) => client.close().await,
            Err(_) => Ok(()),
        }
    })
}

#[derive(clap::Args, Debug)]
struct ProviderArgs {
    /// The executable that implements the resource operations
    #[arg(long)]
    provider_exe: String,

    /// An argument to pass to the provider executable
    #[arg(long)]
    provider_arg: Vec<String>,
}

#[derive(clap::Args, Debug)]
struct InputArgs {
    /// The (whole) JSON input properties for the resource
    ///
    /// This is a JSON object with the values needed to create the resource.
    /// The structure of this object is defined by the resource provider behavior.
    #[arg(long("inputs-json"))]
    input_properties_json: Option<String>,

    /// An individual input property for the resource, in JSON format
    #[arg(long("input-json"),short('j'),number_of_values = 2, value_names = &["NAME", "JSON"])]
    input_property_json: Vec<String>,

    /// An individual input property for the resource, as a raw string.
    ///
    /// This is equivalent to `--input-json NAME JSON` if JSON is the JSON string formatting of STR.
    #[arg(long("input-str"),short('s'),number_of_values = 2, value_names = &["NAME", "STR"])]
    input_property_str: Vec<String>,
}

impl InputArgs {
    /// Gather all input properties, rejecting duplicates.
    ///
    /// clap_derive does not preserve the order of flags across different
    /// arguments, so a later input can not override an earlier one. Duplicates
    /// are rejected instead, which keeps the door open for overriding later.
    fn collect(&self) -> Result<PropertyMap> {
        let mut inputs = match &self.input_properties_json {
            Some(json_string) => serde_json::from_str::<BTreeMap<String, Value>>(json_string)
                .with_context(|| "failed to parse value of --inputs-json")?,
            None => BTreeMap::new(),
        };

        let json_pairs = self.input_property_json.chunks(2).map(|pair| {
            let value = serde_json::from_str(&pair[1])
                .with_context(|| format!("failed to parse JSON value for input: {}", pair[0]));
            (&pair[0], value)
        });
        let str_pairs = self
            .input_property_str
            .chunks(2)
            .map(|pair| (&pair[0], Ok(Value::String(pair[1].clone()))));

        for (k, v) in json_pairs.chain(str_pairs) {
            if inputs.contains_key(k) {
                bail!("duplicate input: {}", k);
            }
            inputs.insert(k.clone(), v?);
        }
        Ok(inputs.into_iter().collect())
    }
}

/// Simple program to run converge resource providers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a resource
    Create {
        #[command(flatten)]
        provider: ProviderArgs,

        /// The URN to present to the provider
        #[arg(long)]
        urn: Urn,

        /// The type of resource to create: an identifier recognized by the resource provider
        #[arg(long("type"))]
        resource_type: String,

        #[command(flatten)]
        inputs: InputArgs,
    },

    /// Read a resource by its ID
    Read {
        #[command(flatten)]
        provider: ProviderArgs,

        #[arg(long)]
        urn: Urn,

        #[arg(long("type"))]
        resource_type: String,

        /// The provider-assigned ID of the resource
        #[arg(long)]
        id: String,
    },

    /// Delete a resource
    Delete {
        #[command(flatten)]
        provider: ProviderArgs,

        #[arg(long)]
        urn: Urn,

        #[arg(long("type"))]
        resource_type: String,

        #[arg(long)]
        id: String,

        #[command(flatten)]
        inputs: InputArgs,
    },

    /// Generate markdown documentation for converge-resource-runner
    #[command(hide = true)]
    GenerateMarkdown,

    /// Generate a manpage for converge-resource-runner
    #[command(hide = true)]
    GenerateMan,

    /// Generate shell completion for converge-resource-runner
    #[command(hide = true)]
    GenerateCompletion {
        /// The shell to generate completion for
        #[arg(long)]
        shell: clap_complete::Shell,
    },
}
