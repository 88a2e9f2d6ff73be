use argh::FromArgs;
use reqwest::multipart::{Form, Part};
use std::{io::Write, path::PathBuf};

// defaults for the client
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 8000;

#[derive(FromArgs)]
/// Vision dialog client for starting and answering dialogs
struct ClientArgs {
    /// the host to connect to
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to connect to
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// command to execute: "new", "answer" or "instruct"
    #[argh(subcommand)]
    command: ClientCommands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum ClientCommands {
    New(NewCommand),
    Answer(AnswerCommand),
    Instruct(InstructCommand),
}

#[derive(FromArgs)]
/// Upload an image and receive clarifying questions
#[argh(subcommand, name = "new")]
struct NewCommand {
    /// the path to the image
    #[argh(option, short = 'i')]
    image_path: PathBuf,

    /// stream the upstream completion
    #[argh(switch, short = 's')]
    stream: bool,
}

#[derive(FromArgs)]
/// Answer the questions of a previous dialog
#[argh(subcommand, name = "answer")]
struct AnswerCommand {
    /// the dialog_state JSON returned by "new"
    #[argh(option)]
    state: String,

    /// answers as a JSON object, e.g. '{"q1": "yes"}'
    #[argh(option, short = 'a')]
    answers: String,

    /// stream the upstream completion
    #[argh(switch, short = 's')]
    stream: bool,
}

#[derive(FromArgs)]
/// Run a one-shot instruction, optionally about an image
#[argh(subcommand, name = "instruct")]
struct InstructCommand {
    /// the instruction text
    #[argh(option, short = 't')]
    text: String,

    /// the path to an optional image
    #[argh(option, short = 'i')]
    image_path: Option<PathBuf>,

    /// print the reply as it streams instead of waiting for all of it
    #[argh(switch, short = 's')]
    stream: bool,
}

async fn image_part(path: &PathBuf) -> Result<Part, Box<dyn std::error::Error>> {
    let bytes = tokio::fs::read(path).await?;
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("image")
        .to_string();
    let mime = match path.extension().and_then(|ext| ext.to_str()) {
        Some("png") => "image/png",
        _ => "image/jpeg",
    };
    Ok(Part::bytes(bytes).file_name(filename).mime_str(mime)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: ClientArgs = argh::from_env();

    let client = reqwest::Client::new();

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    let (route, form) = match args.command {
        ClientCommands::New(command) => (
            "analyze",
            Form::new()
                .text("action", "new")
                .text("stream", command.stream.to_string())
                .part("image", image_part(&command.image_path).await?),
        ),
        ClientCommands::Answer(command) => (
            "analyze",
            Form::new()
                .text("action", "answer")
                .text("answers", command.answers)
                .text("dialog_state", command.state)
                .text("stream", command.stream.to_string()),
        ),
        ClientCommands::Instruct(command) => {
            let mut form = Form::new().text("instruction", command.text);
            if let Some(path) = &command.image_path {
                form = form.part("image", image_part(path).await?);
            }
            let route = if command.stream { "vision_stream" } else { "vision_then_reason" };
            (route, form)
        }
    };

    let mut response = client
        .post(format!("http://{}/{}", addr, route))
        .multipart(form)
        .send()
        .await?;

    if route == "vision_stream" && response.status().is_success() {
        while let Some(chunk) = response.chunk().await? {
            print!("{}", String::from_utf8_lossy(&chunk));
            std::io::stdout().flush()?;
        }
        println!();
        return Ok(());
    }

    let result = response.json::<serde_json::Value>().await?;
    println!("Result: {}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
