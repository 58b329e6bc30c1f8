use serial_test::serial;

use sonet::models::*;
use sonet::repo::inmem::InMemRepo;
use sonet::repo::{
    CommentRepo, PostRepo, ReactionRepo, RepoError, UserRepo, TOMBSTONE_CONTENT,
};

/// Helper that returns a fresh, empty repository for every test run.
fn repo() -> InMemRepo {
    // isolate state: do **not** persist to the default file path
    std::env::set_var("SONET_DATA_DIR", tempfile::tempdir().unwrap().path());
    InMemRepo::new()
}

async fn seed_post(r: &InMemRepo, user_id: &str) -> Post {
    r.create_post(
        user_id,
        NewPost { title: "Hello".into(), text: "first post".into(), photo: None },
        None,
    )
    .await
    .unwrap()
}

async fn seed_comment(
    r: &InMemRepo,
    post_id: &str,
    author_id: &str,
    parent_id: Option<&str>,
) -> Comment {
    r.create_comment(NewComment {
        post_id: post_id.to_string(),
        author_id: author_id.to_string(),
        author_username: author_id.to_string(),
        author_photo: None,
        content: "hi".into(),
        parent_id: parent_id.map(|p| p.to_string()),
    })
    .await
    .unwrap()
}

#[tokio::test]
#[serial]
async fn toggle_same_type_twice_round_trips_to_none() {
    let r = repo();
    let post = seed_post(&r, "u1").await;

    let first = r.toggle_reaction("u2", &post.id, ReactionType::Like).await.unwrap();
    assert_eq!(first.applied, Some(ReactionType::Like));
    assert!(r.get_reaction("u2", &post.id).await.unwrap().is_some());

    let second = r.toggle_reaction("u2", &post.id, ReactionType::Like).await.unwrap();
    assert_eq!(second.applied, None);
    assert!(r.get_reaction("u2", &post.id).await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn switching_reaction_type_replaces_the_single_record() {
    let r = repo();
    let post = seed_post(&r, "u1").await;

    r.toggle_reaction("u2", &post.id, ReactionType::Like).await.unwrap();
    let switched = r.toggle_reaction("u2", &post.id, ReactionType::Dislike).await.unwrap();
    assert_eq!(switched.applied, Some(ReactionType::Dislike));

    // still exactly one record for (user, post), now of the other type
    let reaction = r.get_reaction("u2", &post.id).await.unwrap().unwrap();
    assert_eq!(reaction.kind, ReactionType::Dislike);
    let all = r
        .find_reactions_for_posts("u2", &[post.id.clone()])
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
#[serial]
async fn removing_a_missing_reaction_is_a_noop() {
    let r = repo();
    let post = seed_post(&r, "u1").await;

    // never fails on absence
    r.remove_reaction("ghost", &post.id).await.unwrap();

    r.toggle_reaction("u2", &post.id, ReactionType::Dislike).await.unwrap();
    r.remove_reaction("u2", &post.id).await.unwrap();
    assert!(r.get_reaction("u2", &post.id).await.unwrap().is_none());
    r.remove_reaction("u2", &post.id).await.unwrap();
}

#[tokio::test]
#[serial]
async fn reply_to_reply_is_rejected() {
    let r = repo();
    let post = seed_post(&r, "u1").await;
    let top = seed_comment(&r, &post.id, "u1", None).await;
    let reply = seed_comment(&r, &post.id, "u2", Some(&top.id)).await;
    assert_eq!(reply.parent_id.as_deref(), Some(top.id.as_str()));

    let err = r
        .create_comment(NewComment {
            post_id: post.id.clone(),
            author_id: "u3".into(),
            author_username: "u3".into(),
            author_photo: None,
            content: "nope".into(),
            parent_id: Some(reply.id.clone()),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::InvalidHierarchy));

    // missing parent is NotFound, not InvalidHierarchy
    let err = r
        .create_comment(NewComment {
            post_id: post.id.clone(),
            author_id: "u3".into(),
            author_username: "u3".into(),
            author_photo: None,
            content: "nope".into(),
            parent_id: Some("missing".into()),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RepoError::NotFound));
}

#[tokio::test]
#[serial]
async fn reply_count_is_transactional_with_the_reply_write() {
    let r = repo();
    let post = seed_post(&r, "u1").await;
    let top = seed_comment(&r, &post.id, "u1", None).await;

    let r1 = seed_comment(&r, &post.id, "u2", Some(&top.id)).await;
    seed_comment(&r, &post.id, "u3", Some(&top.id)).await;
    assert_eq!(r.get_comment(&top.id).await.unwrap().reply_count, 2);

    // hard delete of a reply decrements the parent in the same unit: no
    // stale window after the call returns
    r.remove_comment(&r1.id, "u2").await.unwrap();
    assert_eq!(r.get_comment(&top.id).await.unwrap().reply_count, 1);
}

#[tokio::test]
#[serial]
async fn comment_with_replies_is_tombstoned_not_deleted() {
    let r = repo();
    let post = seed_post(&r, "u1").await;
    let top = seed_comment(&r, &post.id, "u1", None).await;
    seed_comment(&r, &post.id, "u2", Some(&top.id)).await;
    seed_comment(&r, &post.id, "u3", Some(&top.id)).await;

    r.remove_comment(&top.id, "u1").await.unwrap();

    let tomb = r.get_comment(&top.id).await.unwrap();
    assert!(tomb.is_deleted);
    assert_eq!(tomb.content, TOMBSTONE_CONTENT);
    assert_eq!(tomb.reply_count, 2);

    // replies stay fetchable through the tombstoned parent
    let replies = r.list_replies(&top.id, 10, None).await.unwrap();
    assert_eq!(replies.items.len(), 2);
}

#[tokio::test]
#[serial]
async fn comment_without_replies_is_hard_deleted() {
    let r = repo();
    let post = seed_post(&r, "u1").await;
    let top = seed_comment(&r, &post.id, "u1", None).await;

    r.remove_comment(&top.id, "u1").await.unwrap();

    assert!(matches!(r.get_comment(&top.id).await, Err(RepoError::NotFound)));
    let page = r.list_top_level(&post.id, 10, None).await.unwrap();
    assert!(page.items.is_empty());
}

#[tokio::test]
#[serial]
async fn edits_are_owner_only_and_blocked_on_tombstones() {
    let r = repo();
    let post = seed_post(&r, "u1").await;
    let top = seed_comment(&r, &post.id, "u1", None).await;

    let err = r.update_comment(&top.id, "intruder", "hacked".into()).await.unwrap_err();
    assert!(matches!(err, RepoError::Forbidden));
    let err = r.remove_comment(&top.id, "intruder").await.unwrap_err();
    assert!(matches!(err, RepoError::Forbidden));

    let updated = r.update_comment(&top.id, "u1", "edited".into()).await.unwrap();
    assert_eq!(updated.content, "edited");

    seed_comment(&r, &post.id, "u2", Some(&top.id)).await;
    r.remove_comment(&top.id, "u1").await.unwrap(); // tombstones
    let err = r.update_comment(&top.id, "u1", "again".into()).await.unwrap_err();
    assert!(matches!(err, RepoError::InvalidState));
}

#[tokio::test]
#[serial]
async fn comment_orderings_are_asymmetric() {
    let r = repo();
    let post = seed_post(&r, "u1").await;
    let c1 = seed_comment(&r, &post.id, "u1", None).await;
    let c2 = seed_comment(&r, &post.id, "u2", None).await;
    let c3 = seed_comment(&r, &post.id, "u3", None).await;

    // top-level: newest first
    let page = r.list_top_level(&post.id, 10, None).await.unwrap();
    let ids: Vec<_> = page.items.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec![c3.id.as_str(), c2.id.as_str(), c1.id.as_str()]);

    // replies: chronological reading order
    let r1 = seed_comment(&r, &post.id, "u2", Some(&c1.id)).await;
    let r2 = seed_comment(&r, &post.id, "u3", Some(&c1.id)).await;
    let page = r.list_replies(&c1.id, 10, None).await.unwrap();
    let ids: Vec<_> = page.items.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec![r1.id.as_str(), r2.id.as_str()]);
}

#[tokio::test]
#[serial]
async fn cursor_walk_covers_the_set_without_duplicates() {
    let r = repo();
    for i in 0..25 {
        r.create_post(
            "u1",
            NewPost { title: format!("post {i}"), text: "t".into(), photo: None },
            None,
        )
        .await
        .unwrap();
    }

    let full = r.list_posts(100, None, PostOrder::Newest).await.unwrap();
    assert_eq!(full.items.len(), 25);
    assert!(!full.has_more);
    assert!(full.next_cursor.is_none());

    let mut walked: Vec<String> = Vec::new();
    let mut cursor: Option<String> = None;
    let mut flags = Vec::new();
    loop {
        let page = r
            .list_posts(10, cursor.as_deref(), PostOrder::Newest)
            .await
            .unwrap();
        flags.push((page.items.len(), page.has_more));
        walked.extend(page.items.iter().map(|p| p.id.clone()));
        match page.next_cursor {
            Some(c) => cursor = Some(c),
            None => break,
        }
    }
    assert_eq!(flags, vec![(10, true), (10, true), (5, false)]);
    let expected: Vec<String> = full.items.iter().map(|p| p.id.clone()).collect();
    assert_eq!(walked, expected);
}

#[tokio::test]
#[serial]
async fn top_ordering_sorts_by_likes() {
    let r = repo();
    let a = seed_post(&r, "u1").await;
    let b = seed_post(&r, "u1").await;
    r.adjust_counters(&b.id, &[(sonet::repo::CounterField::Likes, 3)]).await.unwrap();
    r.adjust_counters(&a.id, &[(sonet::repo::CounterField::Likes, 1)]).await.unwrap();

    let page = r.list_posts(10, None, PostOrder::Top).await.unwrap();
    let ids: Vec<_> = page.items.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec![b.id.as_str(), a.id.as_str()]);
}

#[tokio::test]
#[serial]
async fn bulk_delete_spans_multiple_write_batches() {
    let r = repo();
    let post = seed_post(&r, "host").await;
    let parent = seed_comment(&r, &post.id, "host", None).await;

    // enough delete + decrement pairs to overflow one 512-op batch
    for _ in 0..300 {
        seed_comment(&r, &post.id, "bulk", Some(&parent.id)).await;
    }
    assert_eq!(r.get_comment(&parent.id).await.unwrap().reply_count, 300);

    r.delete_comments_by_user("bulk").await.unwrap();

    assert_eq!(r.get_comment(&parent.id).await.unwrap().reply_count, 0);
    let replies = r.list_replies(&parent.id, 50, None).await.unwrap();
    assert!(replies.items.is_empty());
}

#[tokio::test]
#[serial]
async fn profile_updates_honor_tristate_photo() {
    let r = repo();
    let user = r
        .ensure_user(User {
            id: "u1".into(),
            email: "u1@example.com".into(),
            name: "Ada".into(),
            surname: "Lovelace".into(),
            photo: Some("p1".into()),
            email_verified: false,
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();
    assert!(!user.email_verified);

    // absent photo field leaves it untouched
    let u = r
        .update_user("u1", UpdateUser { name: Some("Augusta".into()), surname: None, photo: None })
        .await
        .unwrap();
    assert_eq!(u.name, "Augusta");
    assert_eq!(u.photo.as_deref(), Some("p1"));

    // explicit null clears it
    let u = r
        .update_user("u1", UpdateUser { name: None, surname: None, photo: Some(None) })
        .await
        .unwrap();
    assert_eq!(u.photo, None);

    // ensure_user only upgrades email_verified, never resets profile data
    let u = r
        .ensure_user(User {
            id: "u1".into(),
            email: "u1@example.com".into(),
            name: "Other".into(),
            surname: "Name".into(),
            photo: Some("p2".into()),
            email_verified: true,
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();
    assert!(u.email_verified);
    assert_eq!(u.name, "Augusta");
    assert_eq!(u.photo, None);
}

#[tokio::test]
#[serial]
async fn author_rename_fans_out_to_posts_and_comments() {
    let r = repo();
    let post = r
        .create_post(
            "u1",
            NewPost { title: "T".into(), text: "t".into(), photo: None },
            Some(AuthorSnapshot {
                name: "Ada".into(),
                surname: "Lovelace".into(),
                photo: Some("old".into()),
            }),
        )
        .await
        .unwrap();
    let comment = seed_comment(&r, &post.id, "u1", None).await;
    let other = seed_comment(&r, &post.id, "u2", None).await;

    let patch = AuthorPatch {
        name: Some("Augusta".into()),
        surname: Some("King".into()),
        photo: Some(None),
    };
    r.update_author_in_posts("u1", &patch).await.unwrap();
    r.update_author_in_comments("u1", &patch).await.unwrap();

    let snap = r.get_post(&post.id).await.unwrap().user.unwrap();
    assert_eq!(snap.name, "Augusta");
    assert_eq!(snap.surname, "King");
    // post snapshots only ever replace the photo, never clear it
    assert_eq!(snap.photo.as_deref(), Some("old"));

    let c = r.get_comment(&comment.id).await.unwrap();
    assert_eq!(c.author_username, "Augusta King");
    assert_eq!(c.author_photo, None);

    // other authors' comments are untouched
    let o = r.get_comment(&other.id).await.unwrap();
    assert_eq!(o.author_username, "u2");
}
