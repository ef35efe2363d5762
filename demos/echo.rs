//! interactive command-line client: connects, then echoes stdin lines to
//! the server and prints whatever comes back.

use std::io::Write;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::util::SubscriberInitExt;
use ws_client::connection::Event;
use ws_client::ClientBuilder;

#[derive(Parser)]
struct Args {
    uri: String,
}

fn main() {
    tracing_subscriber::fmt::fmt()
        .with_max_level(Level::DEBUG)
        .finish()
        .try_init()
        .expect("failed to init log");
    let args = Args::parse();

    let mut conn = ClientBuilder::new(&args.uri)
        .connect()
        .expect("handshake failed");

    let mut input = String::new();
    loop {
        print!("[SEND] > ");
        std::io::stdout().flush().unwrap();
        input.clear();
        if std::io::stdin().read_line(&mut input).unwrap() == 0 {
            break;
        }
        if input == "quit\n" {
            break;
        }
        conn.send_text(input.trim_end()).unwrap();
        match conn.recv() {
            Ok(Event::Text(text)) => {
                println!("[RECV] > {text}");
                if text == "quit" {
                    break;
                }
            }
            Ok(Event::Closed { code, reason }) => {
                println!("[CLOSED] {code:?} {reason}");
                break;
            }
            Ok(other) => println!("[RECV] > {other:?}"),
            Err(e) => {
                eprintln!("error: {e}");
                break;
            }
        }
    }
    let _ = conn.close(1000, "client quit");
}
