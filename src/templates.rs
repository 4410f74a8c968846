use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Pool, Row, Sqlite};

/// Well-known alias the web client uses for the flagship template.
pub const IFINANCE_TEMPLATE_ALIAS: &str = "ifinance-template";
pub const IFINANCE_TEMPLATE_NAME: &str = "Análise Financeira iFinance";

#[derive(Debug, Clone, Serialize)]
pub struct FinancialTemplate {
    pub id: String,
    pub name: String,
    pub description: String,
    pub prompt: String,
    pub category: String,
    pub language: String,
    pub active: bool,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct TemplateSeed {
    name: &'static str,
    description: &'static str,
    prompt: &'static str,
    category: &'static str,
}

const TEMPLATE_SEEDS: &[TemplateSeed] = &[
    TemplateSeed {
        name: IFINANCE_TEMPLATE_NAME,
        description: "Template especializado em análise de DRE e DFC para o mercado brasileiro",
        prompt: IFINANCE_TEMPLATE_PROMPT,
        category: "financial_analysis",
    },
    TemplateSeed {
        name: "Análise de Fluxo de Caixa",
        description: "Template focado em análise detalhada de fluxo de caixa e liquidez",
        prompt: "Você é um especialista em análise de fluxo de caixa. Analise demonstrativos de fluxo de caixa e forneça insights sobre liquidez, necessidades de capital de giro e gestão financeira. Considere o contexto brasileiro e as normas CPC.",
        category: "cash_flow",
    },
    TemplateSeed {
        name: "Relatórios Financeiros",
        description: "Template para geração de relatórios executivos e apresentações",
        prompt: "Você é um especialista em relatórios financeiros corporativos. Crie relatórios executivos, apresentações e dashboards baseados em dados financeiros. Use linguagem clara e gráficos quando apropriado.",
        category: "reporting",
    },
];

const IFINANCE_TEMPLATE_PROMPT: &str = r#"# Sistema: Especialista em Análise Financeira - iFinance

Você é um especialista em análise financeira corporativa, focado no mercado brasileiro.
Sua função é analisar demonstrativos financeiros (DRE e DFC) e fornecer insights
estratégicos para tomada de decisão.

## Sua Expertise:
- Análise de Demonstração do Resultado do Exercício (DRE)
- Análise de Demonstração de Fluxo de Caixa (DFC)
- Cálculo e interpretação de indicadores financeiros
- Identificação de tendências e padrões
- Recomendações estratégicas baseadas em dados

## Metodologia de Análise:

### 1. Análise Horizontal e Vertical
- Compare períodos (mês a mês, ano a ano)
- Calcule variações percentuais
- Identifique tendências significativas

### 2. Indicadores Chave
- Margem de Lucro (Bruta, Operacional, Líquida)
- EBITDA e Margem EBITDA
- Liquidez (Corrente, Seca, Imediata)
- Endividamento
- Retorno sobre Investimento (ROI)
- Prazo Médio de Recebimento/Pagamento

### 3. Análise de Fluxo de Caixa
- Fluxo Operacional
- Fluxo de Investimento
- Fluxo de Financiamento
- Saldo Final de Caixa

### 4. Insights Estratégicos
- Pontos fortes identificados
- Áreas de atenção ou preocupação
- Oportunidades de melhoria
- Recomendações práticas

## Formato de Saída:

### Resumo Executivo
[Visão geral da situação financeira em 2-3 parágrafos]

### Análise Detalhada
[Análise completa dos demonstrativos]

### Indicadores Financeiros
[Tabela com todos os indicadores calculados]

### Próximos Passos e Recomendações
[Ações recomendadas com base na análise]

## Diretrizes:
- Sempre trabalhe em Português (pt-BR)
- Use formatação clara e profissional
- Cite os números dos demonstrativos
- Seja objetivo e prático
- Considere o contexto brasileiro (LGPD, CPC, tributação)
- Mantenha tom consultivo e estratégico

Quando o usuário enviar documentos financeiros, analise-os seguindo esta metodologia e forneça insights valiosos para a gestão corporativa."#;

#[derive(Clone)]
pub struct TemplateStore {
    pool: Pool<Sqlite>,
}

impl TemplateStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS financial_templates (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL,
                prompt TEXT NOT NULL,
                category TEXT NOT NULL,
                language TEXT NOT NULL DEFAULT 'pt-BR',
                active INTEGER NOT NULL DEFAULT 1,
                model TEXT NOT NULL DEFAULT 'gpt-4o-mini',
                temperature REAL NOT NULL DEFAULT 0.3,
                max_tokens INTEGER NOT NULL DEFAULT 4000,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        let store = Self { pool };
        store.seed_defaults().await?;
        Ok(store)
    }

    /// Idempotent seeding: existing templates get their description and
    /// prompt refreshed, missing ones are created.
    async fn seed_defaults(&self) -> Result<(), String> {
        for seed in TEMPLATE_SEEDS {
            let now = Utc::now().to_rfc3339();
            let existing = sqlx::query("SELECT id FROM financial_templates WHERE name = ?")
                .bind(seed.name)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
            if let Some(row) = existing {
                let id: String = row.try_get("id").map_err(|e| e.to_string())?;
                sqlx::query(
                    "UPDATE financial_templates SET description = ?, prompt = ?, updated_at = ? WHERE id = ?",
                )
                .bind(seed.description)
                .bind(seed.prompt)
                .bind(&now)
                .bind(&id)
                .execute(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
            } else {
                sqlx::query(
                    r#"INSERT INTO financial_templates (id, name, description, prompt, category, language, active, model, temperature, max_tokens, created_at, updated_at)
                       VALUES (?, ?, ?, ?, ?, 'pt-BR', 1, 'gpt-4o-mini', 0.3, 4000, ?, ?)"#,
                )
                .bind(uuid::Uuid::new_v4().to_string())
                .bind(seed.name)
                .bind(seed.description)
                .bind(seed.prompt)
                .bind(seed.category)
                .bind(&now)
                .bind(&now)
                .execute(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }

    pub async fn list_active(&self) -> Result<Vec<FinancialTemplate>, String> {
        let rows = sqlx::query(&format!(
            "SELECT {TEMPLATE_COLUMNS} FROM financial_templates WHERE active = 1 ORDER BY name ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_template).collect()
    }

    /// Resolve a template for use; the well-known alias maps to the flagship
    /// template by name. Inactive templates are not resolvable.
    pub async fn resolve_for_use(
        &self,
        template_id: &str,
    ) -> Result<Option<FinancialTemplate>, String> {
        let row = if template_id == IFINANCE_TEMPLATE_ALIAS {
            sqlx::query(&format!(
                "SELECT {TEMPLATE_COLUMNS} FROM financial_templates WHERE name = ? AND active = 1"
            ))
            .bind(IFINANCE_TEMPLATE_NAME)
            .fetch_optional(&self.pool)
            .await
        } else {
            sqlx::query(&format!(
                "SELECT {TEMPLATE_COLUMNS} FROM financial_templates WHERE id = ? AND active = 1"
            ))
            .bind(template_id)
            .fetch_optional(&self.pool)
            .await
        }
        .map_err(|e| e.to_string())?;

        match row {
            Some(row) => Ok(Some(row_to_template(&row)?)),
            None => Ok(None),
        }
    }
}

const TEMPLATE_COLUMNS: &str = "id, name, description, prompt, category, language, active, model, temperature, max_tokens, created_at, updated_at";

fn row_to_template(row: &sqlx::sqlite::SqliteRow) -> Result<FinancialTemplate, String> {
    let parse_ts = |raw: String| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| e.to_string())
    };
    Ok(FinancialTemplate {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        name: row.try_get("name").map_err(|e| e.to_string())?,
        description: row.try_get("description").map_err(|e| e.to_string())?,
        prompt: row.try_get("prompt").map_err(|e| e.to_string())?,
        category: row.try_get("category").map_err(|e| e.to_string())?,
        language: row.try_get("language").map_err(|e| e.to_string())?,
        active: row.try_get::<i32, _>("active").map_err(|e| e.to_string())? == 1,
        model: row.try_get("model").map_err(|e| e.to_string())?,
        temperature: row.try_get("temperature").map_err(|e| e.to_string())?,
        max_tokens: row.try_get("max_tokens").map_err(|e| e.to_string())?,
        created_at: parse_ts(row.try_get("created_at").map_err(|e| e.to_string())?)?,
        updated_at: parse_ts(row.try_get("updated_at").map_err(|e| e.to_string())?)?,
    })
}
