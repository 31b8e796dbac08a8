use anyhow::Context;
use clap::Parser;
use lanshare::catalog::FixedFolder;
use lanshare::node::Node;
use lanshare::peer::PeerAddr;
use lanshare::progress::LogSink;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
struct Cli {
    #[clap(short, long, help = "folder whose files are offered to peers")]
    share: PathBuf,
    #[clap(short, long, help = "folder downloads are written to")]
    out: PathBuf,
    #[clap(short, long, help = "peer to register manually as host:port, repeatable")]
    peer: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Cli::parse();

    anyhow::ensure!(args.share.is_dir(), "share folder {:?} is not a directory", args.share);
    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("creating download folder {:?}", args.out))?;

    let node = Node::start(
        Arc::new(FixedFolder::new(&args.share)),
        args.out.clone(),
        Arc::new(LogSink),
    )?;
    for peer in &args.peer {
        let addr: PeerAddr = peer
            .parse()
            .with_context(|| format!("bad --peer {:?}", peer))?;
        node.register_peer(addr);
    }
    node.discover().context("sending discovery request")?;

    println!(
        "sharing {:?} as {}; downloads go to {:?}",
        args.share,
        node.local_addr(),
        args.out
    );
    println!("commands: peers | search | get <file> | discover | quit");

    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();

        if line == "quit" || line == "exit" {
            break;
        } else if line == "peers" {
            let peers = node.peers();
            if peers.is_empty() {
                println!("no peers known yet; try 'discover'");
            }
            for peer in peers {
                println!("{}", peer);
            }
        } else if line == "discover" {
            node.discover()?;
            println!("discovery request sent");
        } else if line == "search" {
            let offers = node.search();
            if offers.is_empty() {
                println!("nothing offered by the current peer set");
            }
            let mut names: Vec<_> = offers.keys().collect();
            names.sort();
            for name in names {
                println!("{}  ({} peer(s))", name, offers[name].len());
            }
        } else if let Some(name) = line.strip_prefix("get ") {
            let name = name.trim();
            let offers = node.search();
            match offers.get(name) {
                Some(candidates) => {
                    let outcome = node.download(name, candidates);
                    println!("{}: {}", name, outcome.as_status());
                }
                None => println!("no peer offers {:?}", name),
            }
        } else if !line.is_empty() {
            println!("unknown command {:?}", line);
        }
    }

    node.shutdown();
    Ok(())
}
