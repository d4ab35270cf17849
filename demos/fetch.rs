use log::*;
use std::env;
use wireflow::client::WebClient;

#[tokio::main]
async fn main() {
    env_logger::init();

    let url = env::args()
        .nth(1)
        .unwrap_or_else(|| String::from("https://example.com/"));

    let client = WebClient::new();
    match client.get(&url).await {
        Ok(response) => {
            info!("{} {}", response.status, response.reason);
            for (name, value) in response.headers.iter() {
                info!("  {}: {}", name, value);
            }
            match response.text() {
                Ok(body) => println!("{}", body),
                Err(_) => println!("<{} bytes of binary body>", response.body.len()),
            }
        }
        Err(err) => error!("request failed: {}", err),
    }
}
