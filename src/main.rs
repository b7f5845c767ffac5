use actix_cors::Cors;
use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{web, App, HttpServer};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use checkout::config::CheckoutConfig;
use checkout::gateway::PaygateClient;
use checkout::notify::NotificationDispatcher;
use checkout::routes;
use checkout::service::CheckoutService;
use checkout::state::AppState;
use checkout::store::InMemoryOrderStore;

fn build_cors(origins: &[String]) -> Cors {
    if origins.is_empty() {
        // Dev default: allow localhost on any port.
        Cors::default()
            .allowed_origin_fn(|origin, _| {
                origin
                    .to_str()
                    .map(|o| o == "http://localhost" || o.starts_with("http://localhost:"))
                    .unwrap_or(false)
            })
            .allow_any_method()
            .allowed_headers(vec!["content-type", "authorization", "x-admin-key"])
            .max_age(3600)
    } else {
        let mut cors = Cors::default();
        for origin in origins {
            cors = cors.allowed_origin(origin);
        }
        cors.allow_any_method()
            .allowed_headers(vec!["content-type", "authorization", "x-admin-key"])
            .max_age(3600)
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match CheckoutConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(?config, "configuration loaded");

    let gateway = Arc::new(PaygateClient::new(
        config.gateway_api_url.clone(),
        config.gateway_checkout_url.clone(),
        config.wallet_address.clone(),
        config.gateway_timeout,
    ));

    let notifier = Arc::new(NotificationDispatcher::new(
        config.webhook_urls.clone(),
        config.webhook_hmac_secret.clone(),
    ));

    let service = Arc::new(CheckoutService::new(
        Arc::new(InMemoryOrderStore::new()),
        gateway,
        notifier,
        config.order_ttl,
        config.public_base_url.clone(),
    ));

    // Expiry sweep runs on its own schedule, independent of requests.
    service.clone().start_sweep(config.sweep_interval);

    let state = web::Data::new(AppState {
        service,
        admin_key: config.admin_key.clone(),
        metrics_token: config.metrics_token.clone(),
        public_metrics: config.public_metrics,
        success_redirect_url: config.success_redirect_url.clone(),
    });

    let governor_conf = GovernorConfigBuilder::default()
        .requests_per_minute(config.rate_limit_rpm)
        .finish()
        .expect("failed to build rate limiter config");

    let port = config.port;
    let allowed_origins = config.allowed_origins.clone();

    tracing::info!("crypto-checkout listening on port {port}");
    tracing::info!("  POST http://localhost:{port}/api/create-order");
    tracing::info!("  POST http://localhost:{port}/api/process-payment");
    tracing::info!("  GET  http://localhost:{port}/payment-callback/{{orderId}}");
    tracing::info!("  GET  http://localhost:{port}/api/order-status/{{orderId}}");

    HttpServer::new(move || {
        App::new()
            .wrap(build_cors(&allowed_origins))
            .wrap(Governor::new(&governor_conf))
            .app_data(state.clone())
            .app_data(web::JsonConfig::default().limit(65_536))
            .service(routes::create_order)
            .service(routes::process_payment)
            .service(routes::payment_callback)
            .service(routes::order_status)
            .service(routes::admin_verify_order)
            .service(routes::health)
            .service(routes::metrics_endpoint)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
