use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

fn not_found() -> AppError {
    AppError::NotFound("Conversation not found.".to_string())
}

/// Most recently updated first.
pub async fn list_conversations(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let conversations = state.store.list_conversations()?;
    Ok(HttpResponse::Ok().json(json!({ "conversations": conversations })))
}

pub async fn get_conversation(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let conversation_id = path.into_inner();
    let conversation = state
        .store
        .get_conversation(&conversation_id)?
        .ok_or_else(not_found)?;
    let messages = state.store.list_messages(&conversation_id)?;

    Ok(HttpResponse::Ok().json(json!({
        "conversation": conversation,
        "messages": messages
    })))
}

#[derive(Debug, Deserialize)]
pub struct TitleUpdate {
    pub title: String,
}

pub async fn rename_conversation(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<TitleUpdate>,
) -> Result<HttpResponse, AppError> {
    let conversation_id = path.into_inner();
    let title = body.title.trim();
    if title.is_empty() {
        return Err(AppError::ValidationError("Title cannot be empty".to_string()));
    }

    state.store.update_title(&conversation_id, title)?;
    let conversation = state
        .store
        .get_conversation(&conversation_id)?
        .ok_or_else(not_found)?;

    Ok(HttpResponse::Ok().json(json!({ "conversation": conversation })))
}

pub async fn delete_conversation(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    if !state.store.delete_conversation(&path.into_inner())? {
        return Err(not_found());
    }
    Ok(HttpResponse::Ok().json(json!({ "deleted": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::store::Role;
    use actix_web::http::StatusCode;
    use actix_web::test as actix_test;
    use actix_web::App;
    use serde_json::Value;

    fn routes(cfg: &mut web::ServiceConfig) {
        cfg.route("/conversations", web::get().to(list_conversations))
            .route("/conversations/{id}", web::get().to(get_conversation))
            .route("/conversations/{id}", web::patch().to(rename_conversation))
            .route("/conversations/{id}", web::delete().to(delete_conversation));
    }

    #[actix_web::test]
    async fn test_list_and_fetch_conversation() {
        let state = AppState::new(AppConfig::default(), "Be brief.");
        let first = state.store.create_conversation("First").unwrap();
        let second = state.store.create_conversation("Second").unwrap();
        state.store.add_message(&first.id, Role::System, "Be brief.").unwrap();
        state.store.add_message(&first.id, Role::User, "hello").unwrap();

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(routes),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/conversations").to_request();
        let body: Value = actix_test::call_and_read_body_json(&app, req).await;
        let listed: Vec<&str> = body["conversations"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|c| c["id"].as_str())
            .collect();
        assert_eq!(listed, vec![first.id.as_str(), second.id.as_str()]);

        let req = actix_test::TestRequest::get()
            .uri(&format!("/conversations/{}", first.id))
            .to_request();
        let body: Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["conversation"]["title"], "First");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "hello");

        let req = actix_test::TestRequest::get().uri("/conversations/missing").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_rename_and_delete_conversation() {
        let state = AppState::new(AppConfig::default(), "Be brief.");
        let conversation = state.store.create_conversation("Untitled Conversation").unwrap();
        let uri = format!("/conversations/{}", conversation.id);

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(routes),
        )
        .await;

        let req = actix_test::TestRequest::patch()
            .uri(&uri)
            .set_json(json!({ "title": "  Weather chat " }))
            .to_request();
        let body: Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["conversation"]["title"], "Weather chat");

        let req = actix_test::TestRequest::patch()
            .uri(&uri)
            .set_json(json!({ "title": "   " }))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = actix_test::TestRequest::delete().uri(&uri).to_request();
        let body: Value = actix_test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["deleted"], true);
        assert!(state.store.get_conversation(&conversation.id).unwrap().is_none());

        let req = actix_test::TestRequest::delete().uri(&uri).to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
