use collection_query::{FilterOp, MemoryStore, QueryClient, QueryDescriptor};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
struct Shop {
    id: String,
    name: String,
    rating: i64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("🚀 Collection query walkthrough");

    let store = Arc::new(MemoryStore::new());
    for (id, name, rating) in [
        ("a", "Cat Cafe", 5),
        ("b", "Canteen", 3),
        ("c", "Bakery", 4),
        ("d", "Catnip Corner", 2),
        ("e", "Deli", 5),
    ] {
        store.insert("shops", id, json!({ "name": name, "rating": rating }));
    }
    let client = QueryClient::new(store.clone());

    println!("\n1️⃣ One-shot query, twice (second one is served from cache)...");
    let rated = client
        .descriptor("shops")
        .filter("rating", FilterOp::Gte, 4)
        .build()?;
    for _ in 0..2 {
        let shops = client.fetch_page::<Shop>(&rated).await?;
        println!("   📊 {} shops rated 4+", shops.len());
    }
    let stats = client.cache_stats();
    println!("   📈 Cache: {} total, {} valid", stats.total_entries, stats.valid_entries);

    println!("\n2️⃣ Infinite pagination, two shops per page...");
    let mut pages = client.infinite::<Shop>(QueryDescriptor::builder("shops").page_size(2).build()?);
    while pages.has_next_page() {
        let page = pages.fetch_next_page().await?;
        let names: Vec<&str> = page.items.iter().map(|shop| shop.name.as_str()).collect();
        println!("   📄 {:?}", names);
    }
    println!("   ✅ {} shops across {} pages", pages.items().count(), pages.pages().len());

    println!("\n3️⃣ Detail fetch with and without an id...");
    let none = client.fetch_by_id::<Shop>("shops", None).await?;
    println!("   ⏸️ Without id: {:?}", none);
    if let Some(shop) = client.fetch_by_id::<Shop>("shops", Some("e")).await? {
        println!("   🏪 {} ({}) rated {}", shop.name, shop.id, shop.rating);
    }

    println!("\n4️⃣ Live search while typing 'c', 'ca', 'cat'...");
    let base = client.descriptor("shops").search("name", "").build()?;
    let mut live = client.live::<Shop>(base)?;
    for text in ["c", "ca", "cat"] {
        live.set_search_text(text)?;
        tokio::time::sleep(Duration::from_millis(80)).await;
    }
    tokio::time::sleep(client.config().debounce() + Duration::from_millis(50)).await;
    let shops = live.snapshot().data.unwrap_or_default();
    println!(
        "   🔎 Settled on {:?}: {:?}",
        live.descriptor().search_text(),
        shops.iter().map(|shop| &shop.name).collect::<Vec<_>>()
    );

    println!("\n5️⃣ A write reaches the open channel...");
    store.insert("shops", "f", json!({ "name": "Cat Bakery", "rating": 4 }));
    println!("   🔔 Live result now has {} shops", live.snapshot().data.map_or(0, |shops| shops.len()));

    live.close();
    println!("   🧹 Channels left open: {}", store.listener_count());

    println!("\n🎉 Done");
    Ok(())
}
