use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use backend::{
    AppState,
    cache::UserCache,
    config::Config,
    fanout::FanoutRegistry,
    middleware::{RateLimiter, auth_middleware, log_errors, rate_limit},
    notify::NotificationCounter,
    routes,
    store::pg::PgChatStore,
};
use sqlx::Executor;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 加载配置
    let config = Config::from_env().expect("Failed to load configuration");

    #[cfg(debug_assertions)]
    tracing::info!("Running in debug mode with CORS enabled");

    #[cfg(not(debug_assertions))]
    tracing::info!("Running in production mode with CORS disabled");

    // 设置数据库连接池
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("SET application_name = 'shipboard_backend';")
                    .await?;
                Ok(())
            })
        })
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to Postgres");

    // 设置 Redis 客户端
    let redis_client =
        redis::Client::open(config.redis_url.clone()).expect("Failed to create Redis client");
    let redis_arc = Arc::new(redis_client.clone());

    // 设置应用状态
    let state = AppState {
        config: config.clone(),
        redis: redis_arc.clone(),
        store: Arc::new(PgChatStore::new(pool)),
        cache: UserCache::new(redis_arc.clone()),
        notifier: NotificationCounter::new(redis_arc),
        fanout: Arc::new(FanoutRegistry::new()),
    };

    // 设置限流器
    let rate_limiter = Arc::new(RateLimiter::new(redis_client, config.clone()));

    // 将路由分为公开路由和受保护路由
    let public_routes = Router::new().route("/auth/login", post(routes::user::login));

    let protected_routes = Router::new()
        .route("/auth/check-token", get(routes::user::check_token))
        // 群组路由
        .route("/chatgroups/open", get(routes::group::list_open))
        .route("/chatgroups/joined", get(routes::group::list_joined))
        .route("/chatgroups/owned", get(routes::group::list_owned))
        .route("/chatgroups/detail", get(routes::group::get_detail))
        .route("/chatgroups/create", post(routes::group::create_group))
        .route("/chatgroups/cancel", post(routes::group::cancel_group))
        .route("/chatgroups/join", post(routes::group::join_group))
        .route("/chatgroups/unjoin", post(routes::group::leave_group))
        .route("/chatgroups/members/add", post(routes::group::add_member))
        .route(
            "/chatgroups/members/remove",
            post(routes::group::remove_member),
        )
        .route("/chatgroups/report", post(routes::group::report_group))
        // 帖子路由
        .route(
            "/chatgroups/post",
            post(routes::post::create_post).delete(routes::post::delete_post),
        )
        .route("/chatgroups/post/report", post(routes::post::report_post))
        // 实时推送
        .route("/chatgroups/live", get(routes::live::live_updates))
        // 应用认证中间件
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // 创建基础路由
    let router = Router::new().nest(
        &config.api_base_uri.clone(),
        Router::new().merge(public_routes).merge(protected_routes),
    );

    // 添加日志中间件和限流中间件
    let router = router.layer(axum::middleware::from_fn(log_errors)).layer(
        axum::middleware::from_fn_with_state(rate_limiter, rate_limit),
    );

    // 根据编译模式决定是否添加CORS
    #[cfg(debug_assertions)]
    let router = {
        tracing::debug!("Adding CORS layer for development mode");
        let cors = CorsLayer::permissive();
        router.layer(cors)
    };

    // 添加应用状态
    let app = router.with_state(state.clone());

    // 启动服务器
    let addr = SocketAddr::new(
        state.config.server_host.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid server_host, falling back to dual-stack default");
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        }),
        state.config.server_port,
    );
    tracing::info!("Server listening on {}", addr);
    axum::serve(
        tokio::net::TcpListener::bind(&addr)
            .await
            .expect("Failed to bind"),
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Failed to start server");
}
