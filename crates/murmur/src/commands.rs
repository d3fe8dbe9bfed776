//! Subcommand handlers.

use miette::Result;

use murmur_cache::{
    AuthorSnapshot, CollectionKey, Conversation, LoadOutcome, ProfileUpdate, Record, RecordDraft,
    RecordPatch, RecordStatus, Role,
};

use crate::app::App;

fn print_record(record: &Record) {
    let pending = if record.is_local() { "  (not synced)" } else { "" };
    let likes = if record.liked_by.is_empty() {
        String::new()
    } else {
        format!("  ♥{}", record.liked_by.len())
    };
    println!(
        "{}  {:<16} {}{}  [{}]{}",
        record.created_at.format("%Y-%m-%d %H:%M"),
        record.author.name,
        record.content,
        likes,
        record.id,
        pending
    );
}

fn print_conversation(conversation: &Conversation) {
    let name = conversation
        .participant
        .as_ref()
        .map(|p| p.name.as_str())
        .unwrap_or("unknown");
    let unread = if conversation.unread_count > 0 {
        format!(" ({} unread)", conversation.unread_count)
    } else {
        String::new()
    };
    println!(
        "{}  {:<16} {} messages{}  [{}]",
        conversation.last_message_at.format("%Y-%m-%d %H:%M"),
        name,
        conversation.message_count,
        unread,
        conversation.key
    );
}

fn signed_in(app: &App) -> Result<AuthorSnapshot> {
    app.caches
        .session
        .current()
        .ok_or_else(|| miette::miette!("not signed in; run `murmur login` first"))
}

// =============================================================================
// Session
// =============================================================================

pub fn login(app: &App, id: String, name: String, role: &str) -> Result<()> {
    let identity = AuthorSnapshot::new(id, name, Role::from_wire(Some(role)));
    println!("signed in as {} ({})", identity.name, identity.role.as_str());
    app.caches.session.set(identity);
    Ok(())
}

pub fn logout(app: &App) -> Result<()> {
    app.caches.session.clear();
    println!("signed out");
    Ok(())
}

pub async fn whoami(app: &App) -> Result<()> {
    if let Some(rest) = &app.rest {
        app.caches
            .session
            .refresh(rest.as_ref())
            .await
            .map_err(|e| miette::miette!("failed to refresh identity: {}", e))?;
    }
    match app.caches.session.current() {
        Some(identity) => println!(
            "{} ({}, {})",
            identity.name,
            identity.id,
            identity.role.as_str()
        ),
        None => println!("not signed in"),
    }
    Ok(())
}

// =============================================================================
// Collections
// =============================================================================

pub async fn list(app: &App, key: CollectionKey, limit: Option<usize>) -> Result<()> {
    if let Some(parent) = key.parent() {
        app.load(parent).await;
    }
    let outcome = app.load(key).await;

    let records = app.caches.get(key).list();
    if records.is_empty() {
        match outcome {
            LoadOutcome::Failed { .. } => println!("no {} available offline", key),
            _ => println!("no {} yet", key),
        }
        return Ok(());
    }
    for record in records.iter().take(limit.unwrap_or(usize::MAX)) {
        print_record(record);
    }
    Ok(())
}

pub fn post(app: &App, text: String) -> Result<()> {
    let record = app
        .caches
        .posts
        .create(RecordDraft::text(text))
        .map_err(|e| miette::miette!("{}", e))?;
    print_record(&record);
    Ok(())
}

pub async fn comment(app: &App, post_id: &str, text: String) -> Result<()> {
    app.load(CollectionKey::Posts).await;
    let record = app
        .caches
        .comments
        .create(RecordDraft::text(text).with_parent(post_id))
        .map_err(|e| miette::miette!("{}", e))?;
    print_record(&record);
    Ok(())
}

pub fn chat(app: &App, text: String) -> Result<()> {
    let record = app
        .caches
        .community
        .create(RecordDraft::text(text))
        .map_err(|e| miette::miette!("{}", e))?;
    print_record(&record);
    Ok(())
}

async fn patch(app: &App, key: CollectionKey, id: &str, patch: RecordPatch) -> Result<()> {
    app.load(key).await;
    let record = app
        .caches
        .get(key)
        .mutate(id, patch)
        .map_err(|e| miette::miette!("{}", e))?;
    print_record(&record);
    Ok(())
}

pub async fn like(app: &App, key: CollectionKey, id: &str, liked: bool) -> Result<()> {
    let identity_id = signed_in(app)?.id;
    let change = if liked {
        RecordPatch::Like { identity_id }
    } else {
        RecordPatch::Unlike { identity_id }
    };
    patch(app, key, id, change).await
}

pub async fn hide(app: &App, key: CollectionKey, id: &str) -> Result<()> {
    patch(app, key, id, RecordPatch::SetStatus(RecordStatus::Hidden)).await
}

pub async fn edit(app: &App, key: CollectionKey, id: &str, text: String) -> Result<()> {
    patch(app, key, id, RecordPatch::EditContent(text)).await
}

pub async fn delete(app: &App, key: CollectionKey, id: &str) -> Result<()> {
    app.load(key).await;
    for child in CollectionKey::ALL.into_iter().filter(|k| k.parent() == Some(key)) {
        app.load(child).await;
    }

    let report = app
        .caches
        .get(key)
        .delete(id)
        .map_err(|e| miette::miette!("{}", e))?;
    if report.cascaded > 0 {
        println!("deleted {} and {} child records", report.removed.id, report.cascaded);
    } else {
        println!("deleted {}", report.removed.id);
    }
    Ok(())
}

// =============================================================================
// Support
// =============================================================================

pub async fn support_send(app: &App, text: String, to: Option<String>) -> Result<()> {
    app.load(CollectionKey::SupportMessages).await;
    let mut draft = RecordDraft::text(text);
    if let Some(to) = to {
        draft = draft.with_parent(to);
    }
    let record = app
        .caches
        .support_desk()
        .send(draft)
        .map_err(|e| miette::miette!("{}", e))?;
    print_record(&record);
    Ok(())
}

pub async fn support_inbox(app: &App) -> Result<()> {
    app.load(CollectionKey::SupportMessages).await;
    let conversations = app.caches.support_desk().conversations();
    if conversations.is_empty() {
        println!("inbox is empty");
    }
    for conversation in &conversations {
        print_conversation(conversation);
    }
    Ok(())
}

pub async fn support_open(app: &App, conversation: &str) -> Result<()> {
    app.load(CollectionKey::SupportMessages).await;
    let messages = app
        .caches
        .support_desk()
        .open_as_support(conversation)
        .map_err(|e| miette::miette!("{}", e))?;
    for message in &messages {
        print_record(message);
    }
    Ok(())
}

// =============================================================================
// Maintenance
// =============================================================================

pub fn rename(app: &App, name: Option<String>, avatar: Option<String>) -> Result<()> {
    if name.is_none() && avatar.is_none() {
        return Err(miette::miette!("nothing to change; pass --name or --avatar"));
    }
    let identity = signed_in(app)?;
    let report = app.caches.propagator().propagate(&ProfileUpdate {
        identity_id: identity.id,
        name,
        avatar,
    });
    for (key, count) in &report.rewritten {
        println!("{:<20} {} records updated", key.to_string(), count);
    }
    println!("{} records updated", report.total());
    Ok(())
}

pub async fn sync(app: &App) -> Result<()> {
    if !app.reconciler.has_backend() {
        return Err(miette::miette!(
            "no backend configured; set MURMUR_BACKEND_URL and MURMUR_API_KEY"
        ));
    }

    let mut failed = 0;
    for (key, result) in app.reconciler.reconcile_all().await {
        match result {
            Ok(count) => println!("{:<20} {} records", key.to_string(), count),
            Err(e) => {
                failed += 1;
                println!("{:<20} failed: {}", key.to_string(), e);
            }
        }
    }
    let pushed = app.reconciler.flush_outbox().await;
    println!("{} pending writes processed", pushed);

    if failed > 0 {
        return Err(miette::miette!("{} collections could not be synced", failed));
    }
    Ok(())
}

pub fn evict(app: &App) -> Result<()> {
    let report = app.caches.store.evict();
    println!("tier:      {:?}", report.tier);
    println!(
        "size:      {} -> {} bytes ({} freed)",
        report.bytes_before,
        report.bytes_after,
        report.freed()
    );
    for key in &report.removed {
        println!("removed:   {}", key);
    }
    for key in &report.truncated {
        println!("truncated: {}", key);
    }
    for key in &report.restored {
        println!("restored:  {}", key);
    }
    Ok(())
}
